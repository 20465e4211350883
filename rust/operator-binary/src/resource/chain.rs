//! Runs the resources of a request in order

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use super::{CertificateRequest, DynError, ErrorKind, PassContext, Patch, Resource, ResourceError};

/// A single step of a reconciliation pass
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ensure_created(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError>;

    async fn ensure_deleted(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError>;
}

/// Runs a [`Resource`] as a [`Step`] by diffing its current and desired state and applying the result.
///
/// Stops after any phase that canceled the pass.
pub struct CrudStep<R>(pub R);

impl<R: Resource> CrudStep<R> {
    async fn apply(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        patch: Patch<R::Change>,
    ) -> Result<(), R::Error> {
        let resource = &self.0;
        if patch.is_empty() {
            debug!(resource = resource.name(), "Resource is up to date");
        }
        if let Some(change) = &patch.create {
            resource.apply_create(ctx, request, change).await?;
        }
        if ctx.is_canceled() {
            return Ok(());
        }
        if let Some(change) = &patch.delete {
            resource.apply_delete(ctx, request, change).await?;
        }
        if ctx.is_canceled() {
            return Ok(());
        }
        if let Some(change) = &patch.update {
            resource.apply_update(ctx, request, change).await?;
        }
        Ok(())
    }

    async fn run(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        delete: bool,
    ) -> Result<(), R::Error> {
        let resource = &self.0;
        let current = resource.current_state(ctx, request).await?;
        if ctx.is_canceled() {
            return Ok(());
        }
        let desired = resource.desired_state(ctx, request).await?;
        if ctx.is_canceled() {
            return Ok(());
        }
        let patch = if delete {
            resource
                .delete_patch(ctx, request, &current, &desired)
                .await?
        } else {
            resource
                .update_patch(ctx, request, &current, &desired)
                .await?
        };
        if ctx.is_canceled() {
            return Ok(());
        }
        self.apply(ctx, request, patch).await
    }
}

#[async_trait]
impl<R: Resource> Step for CrudStep<R> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    async fn ensure_created(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError> {
        self.run(ctx, request, false).await.map_err(DynError::new)
    }

    async fn ensure_deleted(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError> {
        self.run(ctx, request, true).await.map_err(DynError::new)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("failed to reconcile {step}"))]
pub struct ChainError {
    source: DynError,
    step: &'static str,
}

impl ChainError {
    pub fn step(&self) -> &'static str {
        self.step
    }
}

impl ResourceError for ChainError {
    fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// The steps that a request is reconciled through, in order
pub struct ResourceChain {
    steps: Vec<Box<dyn Step>>,
}

impl ResourceChain {
    /// Access to the backend is checked first, and each later step depends on the ones before it.
    pub fn new(
        access: impl Step + 'static,
        pki: impl Step + 'static,
        role: impl Step + 'static,
        cert: impl Step + 'static,
    ) -> Self {
        Self {
            steps: vec![
                Box::new(access),
                Box::new(pki),
                Box::new(role),
                Box::new(cert),
            ],
        }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub async fn ensure_created(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), ChainError> {
        for step in &self.steps {
            if ctx.is_canceled() {
                info!(step = step.name(), "Pass was canceled, skipping remaining steps");
                break;
            }
            step.ensure_created(ctx, request)
                .await
                .context(ChainSnafu { step: step.name() })?;
        }
        Ok(())
    }

    pub async fn ensure_deleted(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), ChainError> {
        for step in &self.steps {
            if ctx.is_canceled() {
                info!(step = step.name(), "Pass was canceled, skipping remaining steps");
                break;
            }
            step.ensure_deleted(ctx, request)
                .await
                .context(ChainSnafu { step: step.name() })?;
        }
        Ok(())
    }
}
