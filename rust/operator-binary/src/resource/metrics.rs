//! Records how often resource operations run, how long they take, and how they fail

use std::{future::Future, sync::Arc, time::Instant};

use async_trait::async_trait;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use super::{
    chain::Step, CertificateRequest, DynError, PassContext, Patch, Resource, ResourceError,
};

pub struct ResourceMetrics {
    operations: IntCounterVec,
    errors: IntCounterVec,
    duration: HistogramVec,
}

impl ResourceMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let operations = IntCounterVec::new(
            Opts::new(
                "cert_operator_resource_operations_total",
                "Number of operations performed by resources",
            ),
            &["resource", "operation", "object"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "cert_operator_resource_operation_errors_total",
                "Number of resource operations that failed",
            ),
            &["resource", "operation", "kind"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "cert_operator_resource_operation_duration_seconds",
                "Time taken by resource operations",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["resource", "operation"],
        )?;
        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        Ok(Self {
            operations,
            errors,
            duration,
        })
    }

    async fn measure<T, E: ResourceError>(
        &self,
        resource: &str,
        operation: &str,
        request: &CertificateRequest,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        let started = Instant::now();
        let result = fut.await;
        self.operations
            .with_label_values(&[resource, operation, &request.secret_name()])
            .inc();
        self.duration
            .with_label_values(&[resource, operation])
            .observe(started.elapsed().as_secs_f64());
        if let Err(err) = &result {
            self.errors
                .with_label_values(&[resource, operation, <&str>::from(err.kind())])
                .inc();
        }
        result
    }
}

/// Records metrics for the operations of the wrapped [`Resource`] or [`Step`], without affecting their results
pub struct Metered<T> {
    inner: T,
    metrics: Arc<ResourceMetrics>,
}

impl<T> Metered<T> {
    pub fn new(inner: T, metrics: Arc<ResourceMetrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<R: Resource> Resource for Metered<R> {
    type State = R::State;
    type Change = R::Change;
    type Error = R::Error;

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn current_state(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        let fut = self.inner.current_state(ctx, request);
        self.metrics
            .measure(self.inner.name(), "current_state", request, fut)
            .await
    }

    async fn desired_state(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        let fut = self.inner.desired_state(ctx, request);
        self.metrics
            .measure(self.inner.name(), "desired_state", request, fut)
            .await
    }

    async fn update_patch(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        let fut = self.inner.update_patch(ctx, request, current, desired);
        self.metrics
            .measure(self.inner.name(), "update_patch", request, fut)
            .await
    }

    async fn delete_patch(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        let fut = self.inner.delete_patch(ctx, request, current, desired);
        self.metrics
            .measure(self.inner.name(), "delete_patch", request, fut)
            .await
    }

    async fn apply_create(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        let fut = self.inner.apply_create(ctx, request, change);
        self.metrics
            .measure(self.inner.name(), "apply_create", request, fut)
            .await
    }

    async fn apply_update(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        let fut = self.inner.apply_update(ctx, request, change);
        self.metrics
            .measure(self.inner.name(), "apply_update", request, fut)
            .await
    }

    async fn apply_delete(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        let fut = self.inner.apply_delete(ctx, request, change);
        self.metrics
            .measure(self.inner.name(), "apply_delete", request, fut)
            .await
    }
}

#[async_trait]
impl<S: Step> Step for Metered<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn ensure_created(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError> {
        let fut = self.inner.ensure_created(ctx, request);
        self.metrics
            .measure(self.inner.name(), "ensure_created", request, fut)
            .await
    }

    async fn ensure_deleted(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError> {
        let fut = self.inner.ensure_deleted(ctx, request);
        self.metrics
            .measure(self.inner.name(), "ensure_deleted", request, fut)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prometheus::Registry;

    use super::{Metered, ResourceMetrics};
    use crate::resource::{
        access::AccessGuard,
        chain::Step,
        pki::{PkiResource, PkiState},
        testing::{self, Fakes},
        ErrorKind, PassContext, Resource, ResourceError,
    };

    #[tokio::test]
    async fn results_pass_through_unchanged() {
        let registry = Registry::new();
        let metrics = Arc::new(ResourceMetrics::new(&registry).unwrap());
        let fakes = Fakes::new();
        let resource = Metered::new(PkiResource::new(fakes.backend.clone()), metrics.clone());
        let request = testing::request();
        let ctx = PassContext::default();

        assert_eq!(Resource::name(&resource), "pki");
        assert_eq!(
            resource.current_state(&ctx, &request).await.unwrap(),
            PkiState::default()
        );
        resource.current_state(&ctx, &request).await.unwrap();
        assert_eq!(
            metrics
                .operations
                .with_label_values(&["pki", "current_state", "al9qy-api"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .duration
                .with_label_values(&["pki", "current_state"])
                .get_sample_count(),
            2
        );
        assert!(registry
            .gather()
            .iter()
            .any(|family| family.get_name() == "cert_operator_resource_operations_total"));
    }

    #[tokio::test]
    async fn errors_are_counted_by_kind() {
        let registry = Registry::new();
        let metrics = Arc::new(ResourceMetrics::new(&registry).unwrap());
        let fakes = Fakes::new();
        fakes.backend.state().token_error = Some("permission denied".to_string());
        let guard = Metered::new(AccessGuard::new(fakes.backend.clone()), metrics.clone());

        let err = guard
            .ensure_created(&PassContext::default(), &testing::request())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unclassified);
        assert_eq!(
            metrics
                .errors
                .with_label_values(&["access", "ensure_created", "unclassified"])
                .get(),
            1
        );
    }

    #[test]
    fn metrics_register_once_per_registry() {
        let registry = Registry::new();
        ResourceMetrics::new(&registry).unwrap();
        assert!(ResourceMetrics::new(&registry).is_err());
    }
}
