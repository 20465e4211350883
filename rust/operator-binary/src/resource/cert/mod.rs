//! Issues the leaf certificate of a request and keeps its Secret up to date

pub mod renewal;
pub mod secret;

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{ensure, ResultExt, Snafu};
use stackable_operator::time::Duration;
use tracing::{debug, info};

pub use self::{
    renewal::{RenewalError, RenewalPolicy},
    secret::{CertificateData, CertificateSecret},
};
use super::{
    role::desired_organizations, CertificateRequest, ErrorKind, PassContext, Patch, Resource,
    ResourceError,
};
use crate::{
    backend::{BackendError, CaBackend, IssueRequest},
    store::{PodLister, SecretStore, StoreError},
    utils::Clock,
};

/// Default for [`CertResourceConfig::expiration_threshold`]
///
/// Must stay below the TTLs that clusters request, which are commonly a day.
pub const DEFAULT_EXPIRATION_THRESHOLD: Duration = Duration::from_hours_unchecked(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertResourceConfig {
    /// Namespace that certificate Secrets are stored in
    pub namespace: String,
    /// Written to the `operator-version` label
    pub operator_version: String,
    pub expiration_threshold: Duration,
    pub non_regenerating_components: Vec<String>,
    /// Components whose Secret is only deleted once the cluster has no live pods left
    pub drain_gated_components: Vec<String>,
}

impl CertResourceConfig {
    pub fn new(namespace: impl Into<String>, operator_version: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            operator_version: operator_version.into(),
            expiration_threshold: DEFAULT_EXPIRATION_THRESHOLD,
            non_regenerating_components: vec!["service-account".to_string()],
            drain_gated_components: [
                "api",
                "etcd",
                "worker",
                "calico-etcd-client",
                "service-account",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig { reason: &'static str },

    #[snafu(display("failed to get certificate Secret"))]
    GetSecret { source: StoreError },

    #[snafu(display("certificate Secret has an unexpected shape"))]
    InvalidSecret { source: secret::Error },

    #[snafu(display("failed to build desired certificate Secret"))]
    BuildSecret { source: secret::Error },

    #[snafu(display("failed to count live pods of cluster {cluster_id:?}"))]
    ListPods {
        source: StoreError,
        cluster_id: String,
    },

    #[snafu(display("failed to decide whether to renew the certificate"))]
    Renewal { source: RenewalError },

    #[snafu(display("failed to issue certificate for {secret:?}"))]
    IssueCertificate {
        source: BackendError,
        secret: String,
    },

    #[snafu(display("failed to create certificate Secret"))]
    CreateSecret { source: StoreError },

    #[snafu(display("failed to update certificate Secret"))]
    UpdateSecret { source: StoreError },

    #[snafu(display("failed to delete certificate Secret"))]
    DeleteSecret { source: StoreError },
}

impl ResourceError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Error::InvalidSecret { .. } => ErrorKind::WrongType,
            Error::Renewal { source } => source.kind(),
            Error::BuildSecret { .. } => ErrorKind::ExecutionFailed,
            Error::GetSecret { .. }
            | Error::ListPods { .. }
            | Error::IssueCertificate { .. }
            | Error::CreateSecret { .. }
            | Error::UpdateSecret { .. }
            | Error::DeleteSecret { .. } => ErrorKind::Unclassified,
        }
    }
}

pub struct CertResource {
    backend: Arc<dyn CaBackend>,
    secrets: Arc<dyn SecretStore>,
    pods: Arc<dyn PodLister>,
    clock: Arc<dyn Clock>,
    config: CertResourceConfig,
    policy: RenewalPolicy,
}

impl CertResource {
    pub fn new(
        backend: Arc<dyn CaBackend>,
        secrets: Arc<dyn SecretStore>,
        pods: Arc<dyn PodLister>,
        clock: Arc<dyn Clock>,
        config: CertResourceConfig,
    ) -> Result<Self, Error> {
        ensure!(
            !config.namespace.is_empty(),
            InvalidConfigSnafu {
                reason: "the Secret namespace must not be empty"
            }
        );
        ensure!(
            !config.expiration_threshold.is_zero(),
            InvalidConfigSnafu {
                reason: "the expiration threshold must be positive"
            }
        );
        let policy = RenewalPolicy {
            expiration_threshold: config.expiration_threshold,
            non_regenerating_components: config.non_regenerating_components.clone(),
        };
        Ok(Self {
            backend,
            secrets,
            pods,
            clock,
            config,
            policy,
        })
    }

    async fn issue(
        &self,
        request: &CertificateRequest,
        secret: &CertificateSecret,
    ) -> Result<CertificateData, Error> {
        let issued = self
            .backend
            .issue_certificate(&IssueRequest {
                cluster_id: request.cluster_id.clone(),
                common_name: request.common_name.clone(),
                alt_names: request.alt_names.clone(),
                ip_sans: request.ip_sans.clone(),
                organizations: desired_organizations(request),
                ttl: request.ttl,
            })
            .await
            .context(IssueCertificateSnafu {
                secret: &secret.name,
            })?;
        info!(secret = %secret.name, "Issued certificate");
        Ok(issued.into())
    }

    /// Whether deleting the Secret must wait, because workloads of the cluster may still be using it
    async fn is_drain_pending(&self, request: &CertificateRequest) -> Result<bool, Error> {
        if !request.marked_for_deletion
            || !self
                .config
                .drain_gated_components
                .contains(&request.cluster_component)
        {
            return Ok(false);
        }
        let live_pods = self
            .pods
            .live_pods(&request.cluster_id)
            .await
            .context(ListPodsSnafu {
                cluster_id: &request.cluster_id,
            })?;
        if live_pods > 0 {
            info!(
                cluster.id = %request.cluster_id,
                cluster.component = %request.cluster_component,
                live_pods,
                "Cluster still has live pods, keeping certificate until they are gone"
            );
        }
        Ok(live_pods > 0)
    }
}

#[async_trait]
impl Resource for CertResource {
    type State = Option<CertificateSecret>;
    type Change = CertificateSecret;
    type Error = Error;

    fn name(&self) -> &'static str {
        "cert"
    }

    async fn current_state(
        &self,
        ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        let current = self
            .secrets
            .get(&request.secret_name(), &self.config.namespace)
            .await
            .context(GetSecretSnafu)?
            .map(CertificateSecret::from_secret)
            .transpose()
            .context(InvalidSecretSnafu)?;
        if self.is_drain_pending(request).await? {
            ctx.cancel();
            ctx.keep_finalizer();
        }
        Ok(current)
    }

    async fn desired_state(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        CertificateSecret::desired(
            request,
            &self.config.namespace,
            &self.config.operator_version,
            self.clock.now(),
        )
        .map(Some)
        .context(BuildSecretSnafu)
    }

    async fn update_patch(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        let Some(desired) = desired else {
            return Ok(Patch::default());
        };
        self.policy.validate(request).context(RenewalSnafu)?;
        if current.is_none() {
            let data = self.issue(request, desired).await?;
            return Ok(Patch::create(desired.clone().with_data(data)));
        }
        match self
            .policy
            .should_renew(request, current.as_ref(), desired, self.clock.now())
        {
            Ok(true) => {
                let data = self.issue(request, desired).await?;
                Ok(Patch::update(desired.clone().with_data(data)))
            }
            Ok(false) => Ok(Patch::default()),
            Err(err) if err.kind() == ErrorKind::MissingAnnotation => {
                info!(
                    secret = %desired.name,
                    error = &err as &dyn std::error::Error,
                    "Not renewing certificate"
                );
                Ok(Patch::default())
            }
            Err(err) => Err(err).context(RenewalSnafu),
        }
    }

    async fn delete_patch(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        current: &Self::State,
        _desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        Ok(match current {
            Some(current) => Patch::delete(current.clone()),
            None => Patch::default(),
        })
    }

    async fn apply_create(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        match self.secrets.create(&change.to_secret()).await {
            Ok(()) => {
                info!(secret = %change.name, "Created certificate Secret");
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(secret = %change.name, "Certificate Secret already exists");
                Ok(())
            }
            Err(err) => Err(err).context(CreateSecretSnafu),
        }
    }

    async fn apply_update(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        self.secrets
            .update(&change.to_secret())
            .await
            .context(UpdateSecretSnafu)?;
        info!(secret = %change.name, "Updated certificate Secret");
        Ok(())
    }

    async fn apply_delete(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        self.secrets
            .delete(&change.name, &change.namespace)
            .await
            .context(DeleteSecretSnafu)?;
        info!(secret = %change.name, "Deleted certificate Secret");
        Ok(())
    }
}
