//! Checks the operator's own access to the CA backend before anything else is reconciled

use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;
use tracing::warn;

use super::{chain::Step, CertificateRequest, DynError, ErrorKind, PassContext, ResourceError};
use crate::{
    backend::{BackendError, CaBackend},
    utils::error_full_message,
};

/// Messages of errors that mean that the backend is temporarily unreachable, rather than broken
const UNAVAILABLE_MESSAGES: &[&str] = &[
    "connection refused",
    "no route to host",
    "vault is sealed",
    "service unavailable",
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to renew the operator's backend token"))]
    RenewToken { source: BackendError },

    #[snafu(display("failed to look up the operator's backend token"))]
    LookupToken { source: BackendError },
}

impl ResourceError for Error {
    fn kind(&self) -> ErrorKind {
        if is_backend_unavailable(self) {
            ErrorKind::BackendUnavailable
        } else {
            ErrorKind::Unclassified
        }
    }
}

pub fn is_backend_unavailable(err: &dyn std::error::Error) -> bool {
    let message = error_full_message(err).to_lowercase();
    UNAVAILABLE_MESSAGES
        .iter()
        .any(|unavailable| message.contains(unavailable))
}

pub struct AccessGuard {
    backend: Arc<dyn CaBackend>,
}

impl AccessGuard {
    pub fn new(backend: Arc<dyn CaBackend>) -> Self {
        Self { backend }
    }

    /// Cancels the pass if the backend is unavailable, any other error is returned.
    fn handle(&self, ctx: &PassContext, result: Result<(), Error>) -> Result<(), DynError> {
        match result {
            Err(err) if err.kind() == ErrorKind::BackendUnavailable => {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "CA backend is unavailable, skipping this pass"
                );
                ctx.cancel();
                Ok(())
            }
            result => result.map_err(DynError::new),
        }
    }
}

#[async_trait]
impl Step for AccessGuard {
    fn name(&self) -> &'static str {
        "access"
    }

    async fn ensure_created(
        &self,
        ctx: &PassContext,
        _request: &CertificateRequest,
    ) -> Result<(), DynError> {
        let result = self
            .backend
            .renew_own_token()
            .await
            .map_err(|source| Error::RenewToken { source });
        self.handle(ctx, result)
    }

    async fn ensure_deleted(
        &self,
        ctx: &PassContext,
        _request: &CertificateRequest,
    ) -> Result<(), DynError> {
        let result = self
            .backend
            .lookup_own_token()
            .await
            .map_err(|source| Error::LookupToken { source });
        self.handle(ctx, result)
    }
}
