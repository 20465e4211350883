//! Retries failed resource operations with exponential backoff and jitter

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use super::{
    chain::Step, CertificateRequest, DynError, PassContext, Patch, Resource, ResourceError,
};

/// How often and how quickly failed operations are retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomizes each delay by up to this fraction in either direction
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..1.0 + self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor.max(0.0))
    }

    /// Runs `f` until it succeeds, fails with an error that is not retryable, the pass is
    /// canceled, or the attempts run out.
    pub async fn run<T, E, F, Fut>(
        &self,
        ctx: &PassContext,
        resource: &str,
        operation: &str,
        mut f: F,
    ) -> Result<T, E>
    where
        E: ResourceError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        let mut delay = self.initial_delay;
        loop {
            attempt += 1;
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_attempts || !err.kind().is_retryable() || ctx.is_canceled() {
                return Err(err);
            }
            let wait = self.jittered(delay);
            warn!(
                resource,
                operation,
                attempt,
                error = &err as &dyn std::error::Error,
                delay_ms = wait.as_millis(),
                "Operation failed, retrying"
            );
            tokio::time::sleep(wait).await;
            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
            );
        }
    }
}

/// Retries the operations of the wrapped [`Resource`] or [`Step`] according to a [`RetryPolicy`]
pub struct Retried<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retried<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<R: Resource> Resource for Retried<R> {
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
        self.policy
            .run(ctx, self.inner.name(), "current_state", || {
                self.inner.current_state(ctx, request)
            })
            .await
    }

    async fn desired_state(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        self.policy
            .run(ctx, self.inner.name(), "desired_state", || {
                self.inner.desired_state(ctx, request)
            })
            .await
    }

    async fn update_patch(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        self.policy
            .run(ctx, self.inner.name(), "update_patch", || {
                self.inner.update_patch(ctx, request, current, desired)
            })
            .await
    }

    async fn delete_patch(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        self.policy
            .run(ctx, self.inner.name(), "delete_patch", || {
                self.inner.delete_patch(ctx, request, current, desired)
            })
            .await
    }

    async fn apply_create(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        self.policy
            .run(ctx, self.inner.name(), "apply_create", || {
                self.inner.apply_create(ctx, request, change)
            })
            .await
    }

    async fn apply_update(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        self.policy
            .run(ctx, self.inner.name(), "apply_update", || {
                self.inner.apply_update(ctx, request, change)
            })
            .await
    }

    async fn apply_delete(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        self.policy
            .run(ctx, self.inner.name(), "apply_delete", || {
                self.inner.apply_delete(ctx, request, change)
            })
            .await
    }
}

#[async_trait]
impl<S: Step> Step for Retried<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn ensure_created(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError> {
        self.policy
            .run(ctx, self.inner.name(), "ensure_created", || {
                self.inner.ensure_created(ctx, request)
            })
            .await
    }

    async fn ensure_deleted(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<(), DynError> {
        self.policy
            .run(ctx, self.inner.name(), "ensure_deleted", || {
                self.inner.ensure_deleted(ctx, request)
            })
            .await
    }
}
