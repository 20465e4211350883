//! The resources that a [`CertConfig`] is reconciled into, and the engine that drives them
//!
//! Each [`Resource`] computes its current and desired state, diffs them into a [`Patch`], and applies
//! the non-empty parts of that patch. The [`chain::ResourceChain`] runs the resources in a fixed order.

pub mod access;
pub mod cert;
pub mod chain;
pub mod metrics;
pub mod pki;
pub mod retry;
pub mod role;

#[cfg(test)]
pub(crate) mod testing;

use std::{
    fmt::{Debug, Display},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use snafu::{ensure, Snafu};
use stackable_operator::time::Duration;
use strum::IntoStaticStr;

use crate::crd::CertConfig;

/// Longest TTL that a certificate may be requested with
pub const MAX_CERT_TTL: Duration = Duration::from_days_unchecked(10 * 365);

/// A validated request for one certificate, the input to a single reconciliation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
    pub cluster_id: String,
    pub cluster_component: String,
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub ip_sans: Vec<String>,
    pub organizations: Vec<String>,
    pub allow_bare_domains: bool,
    pub ttl: Duration,
    pub disable_regeneration: bool,
    pub version_bundle_version: String,
    /// Whether the owning object is being deleted
    pub marked_for_deletion: bool,
}

impl CertificateRequest {
    /// Name of the Secret that holds the certificate
    pub fn secret_name(&self) -> String {
        format!("{}-{}", self.cluster_id, self.cluster_component)
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum InvalidRequestError {
    #[snafu(display("clusterId must not be empty"))]
    EmptyClusterId,

    #[snafu(display("clusterComponent must not be empty"))]
    EmptyClusterComponent,

    #[snafu(display("commonName must not be empty"))]
    EmptyCommonName,

    #[snafu(display("ttl must be positive"))]
    ZeroTtl,

    #[snafu(display("ttl {ttl} exceeds the maximum of {max}"))]
    TtlTooLong { ttl: Duration, max: Duration },
}

impl ResourceError for InvalidRequestError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidConfig
    }
}

impl TryFrom<&CertConfig> for CertificateRequest {
    type Error = InvalidRequestError;

    fn try_from(cert_config: &CertConfig) -> Result<Self, Self::Error> {
        use invalid_request_error::*;
        let spec = &cert_config.spec;
        ensure!(!spec.cluster_id.is_empty(), EmptyClusterIdSnafu);
        ensure!(
            !spec.cluster_component.is_empty(),
            EmptyClusterComponentSnafu
        );
        ensure!(!spec.common_name.is_empty(), EmptyCommonNameSnafu);
        ensure!(!spec.ttl.is_zero(), ZeroTtlSnafu);
        ensure!(
            spec.ttl <= MAX_CERT_TTL,
            TtlTooLongSnafu {
                ttl: spec.ttl,
                max: MAX_CERT_TTL,
            }
        );
        Ok(Self {
            cluster_id: spec.cluster_id.clone(),
            cluster_component: spec.cluster_component.clone(),
            common_name: spec.common_name.clone(),
            alt_names: spec.alt_names.clone(),
            ip_sans: spec.ip_sans.clone(),
            organizations: spec.organizations.clone(),
            allow_bare_domains: spec.allow_bare_domains,
            ttl: spec.ttl,
            disable_regeneration: spec.disable_regeneration,
            version_bundle_version: spec.version_bundle_version.clone(),
            marked_for_deletion: cert_config.metadata.deletion_timestamp.is_some(),
        })
    }
}

/// Coarse classification of errors, which decides how they are handled
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// Misconfiguration detected while constructing the operator or reading the request
    InvalidConfig,
    /// An object did not have the expected shape
    WrongType,
    /// A stored certificate lacks the annotations needed to decide on renewal
    MissingAnnotation,
    /// Absent objects are turned into an empty state where they are fetched, so this is never returned by resources
    NotFound,
    /// The CA backend is temporarily unreachable, [`access::AccessGuard`] cancels the pass instead of failing it
    BackendUnavailable,
    ExecutionFailed,
    /// Upstream errors that were not classified any further
    Unclassified,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ExecutionFailed | ErrorKind::Unclassified)
    }
}

/// Errors returned by resources
pub trait ResourceError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}

/// Type-erased [`ResourceError`], used where resources with different error types are combined
pub struct DynError(Box<dyn ResourceError>);

impl DynError {
    pub fn new(err: impl ResourceError) -> Self {
        Self(Box::new(err))
    }
}

impl Debug for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for DynError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl ResourceError for DynError {
    fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

/// Signals shared between the resources of a single reconciliation pass and its driver
#[derive(Debug, Default)]
pub struct PassContext {
    canceled: AtomicBool,
    keep_finalizer: AtomicBool,
}

impl PassContext {
    /// Skips the remaining work of this pass, it is picked up again by the next one.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Asks the driver not to remove the finalizer of the object that is being deleted.
    pub fn keep_finalizer(&self) {
        self.keep_finalizer.store(true, Ordering::SeqCst);
    }

    pub fn is_finalizer_kept(&self) -> bool {
        self.keep_finalizer.load(Ordering::SeqCst)
    }
}

/// The changes required to move a resource from its current to its desired state.
///
/// A `None` field means that nothing needs to be done in that phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch<C> {
    pub create: Option<C>,
    pub update: Option<C>,
    pub delete: Option<C>,
}

impl<C> Default for Patch<C> {
    fn default() -> Self {
        Self {
            create: None,
            update: None,
            delete: None,
        }
    }
}

impl<C> Patch<C> {
    pub fn create(change: C) -> Self {
        Self {
            create: Some(change),
            ..Self::default()
        }
    }

    pub fn update(change: C) -> Self {
        Self {
            update: Some(change),
            ..Self::default()
        }
    }

    pub fn delete(change: C) -> Self {
        Self {
            delete: Some(change),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }
}

/// Something that the operator manages on behalf of a [`CertificateRequest`].
///
/// `apply_*` are only called with the corresponding field of a [`Patch`] returned by
/// [`Resource::update_patch`] or [`Resource::delete_patch`], and only if that field is set.
#[async_trait]
pub trait Resource: Send + Sync {
    type State: Debug + Send + Sync;
    type Change: Debug + Send + Sync;
    type Error: ResourceError;

    /// Stable name, used for logging and metrics
    fn name(&self) -> &'static str;

    async fn current_state(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error>;

    async fn desired_state(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error>;

    /// Computes the changes needed while the request exists.
    async fn update_patch(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error>;

    /// Computes the changes needed once the request is being deleted.
    async fn delete_patch(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error>;

    async fn apply_create(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error>;

    async fn apply_update(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error>;

    async fn apply_delete(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use stackable_operator::{
        k8s_openapi::apimachinery::pkg::apis::meta::v1::Time, kube::api::ObjectMeta,
        time::Duration,
    };

    use super::{
        CertificateRequest, ErrorKind, InvalidRequestError, PassContext, Patch, ResourceError,
        MAX_CERT_TTL,
    };
    use crate::{crd::CertConfig, resource::testing};

    fn cert_config(cluster_id: &str) -> CertConfig {
        cert_config_for(CertificateRequest {
            cluster_id: cluster_id.to_string(),
            ..testing::request()
        })
    }

    fn cert_config_for(request: CertificateRequest) -> CertConfig {
        CertConfig {
            metadata: ObjectMeta {
                name: Some("al9qy-api".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            spec: crate::crd::CertConfigSpec {
                cluster_id: request.cluster_id,
                cluster_component: request.cluster_component,
                common_name: request.common_name,
                alt_names: request.alt_names,
                ip_sans: request.ip_sans,
                organizations: request.organizations,
                allow_bare_domains: request.allow_bare_domains,
                ttl: request.ttl,
                disable_regeneration: request.disable_regeneration,
                version_bundle_version: request.version_bundle_version,
            },
            status: None,
        }
    }

    #[test]
    fn request_from_cert_config() {
        let request = CertificateRequest::try_from(&cert_config("al9qy")).unwrap();
        assert_eq!(request, testing::request());
        assert_eq!(request.secret_name(), "al9qy-api");

        let mut deleted = cert_config("al9qy");
        deleted.metadata.deletion_timestamp = Some(Time(Default::default()));
        assert!(
            CertificateRequest::try_from(&deleted)
                .unwrap()
                .marked_for_deletion
        );
    }

    #[test]
    fn request_requires_cluster_id() {
        assert!(matches!(
            CertificateRequest::try_from(&cert_config("")),
            Err(InvalidRequestError::EmptyClusterId)
        ));
    }

    #[test]
    fn request_requires_common_name() {
        let err = CertificateRequest::try_from(&cert_config_for(CertificateRequest {
            common_name: String::new(),
            ..testing::request()
        }))
        .unwrap_err();
        assert!(matches!(err, InvalidRequestError::EmptyCommonName));
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn request_ttl_is_bounded() {
        let with_ttl = |ttl| {
            CertificateRequest::try_from(&cert_config_for(CertificateRequest {
                ttl,
                ..testing::request()
            }))
        };
        assert!(matches!(
            with_ttl(Duration::from_days_unchecked(4_000_000)),
            Err(InvalidRequestError::TtlTooLong { .. })
        ));
        assert!(matches!(
            with_ttl(Duration::from_secs(0)),
            Err(InvalidRequestError::ZeroTtl)
        ));
        assert_eq!(with_ttl(MAX_CERT_TTL).unwrap().ttl, MAX_CERT_TTL);
    }

    #[test]
    fn only_execution_failures_are_retryable() {
        assert!(ErrorKind::ExecutionFailed.is_retryable());
        assert!(ErrorKind::Unclassified.is_retryable());
        assert!(!ErrorKind::InvalidConfig.is_retryable());
        assert!(!ErrorKind::BackendUnavailable.is_retryable());
        assert!(!ErrorKind::MissingAnnotation.is_retryable());
        assert_eq!(<&str>::from(ErrorKind::MissingAnnotation), "missing-annotation");
    }

    #[test]
    fn pass_context_flags() {
        let ctx = PassContext::default();
        assert!(!ctx.is_canceled());
        assert!(!ctx.is_finalizer_kept());
        ctx.cancel();
        ctx.keep_finalizer();
        assert!(ctx.is_canceled());
        assert!(ctx.is_finalizer_kept());
    }

    #[test]
    fn patch_emptiness() {
        assert!(Patch::<()>::default().is_empty());
        assert!(!Patch::create(()).is_empty());
        assert!(!Patch::delete(()).is_empty());
    }
}
