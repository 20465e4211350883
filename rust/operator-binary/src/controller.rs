//! Reconciles every [`CertConfig`] in the cluster through the [`ResourceChain`]

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    kube::{
        self,
        api::{Api, Patch, PatchParams},
        runtime::{
            controller::{self, Action},
            reflector::ObjectRef,
            watcher, Controller,
        },
        ResourceExt,
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    backend::CaBackend,
    crd::CertConfig,
    resource::{
        access::AccessGuard,
        cert::{self, CertResource, CertResourceConfig},
        chain::{ChainError, CrudStep, ResourceChain},
        metrics::{Metered, ResourceMetrics},
        pki::PkiResource,
        retry::{Retried, RetryPolicy},
        role::RoleResource,
        CertificateRequest, InvalidRequestError, PassContext,
    },
    store::{PodLister, SecretStore},
    utils::Clock,
};

pub const FINALIZER: &str = "certs.stackable.tech/cert-operator";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// How often certificates are checked for renewal when nothing else changes
    pub resync_period: Duration,
    /// How soon a pass that was canceled is tried again
    pub canceled_requeue_period: Duration,
}

/// Wires the resources of a request into a chain, each retried and metered.
pub fn resource_chain(
    backend: Arc<dyn CaBackend>,
    secrets: Arc<dyn SecretStore>,
    pods: Arc<dyn PodLister>,
    clock: Arc<dyn Clock>,
    cert_config: CertResourceConfig,
    retry: &RetryPolicy,
    metrics: &Arc<ResourceMetrics>,
) -> Result<ResourceChain, cert::Error> {
    let cert = CertResource::new(backend.clone(), secrets, pods, clock, cert_config)?;
    Ok(ResourceChain::new(
        Retried::new(
            Metered::new(AccessGuard::new(backend.clone()), metrics.clone()),
            retry.clone(),
        ),
        CrudStep(Retried::new(
            Metered::new(PkiResource::new(backend.clone()), metrics.clone()),
            retry.clone(),
        )),
        CrudStep(Retried::new(
            Metered::new(RoleResource::new(backend), metrics.clone()),
            retry.clone(),
        )),
        CrudStep(Retried::new(
            Metered::new(cert, metrics.clone()),
            retry.clone(),
        )),
    ))
}

pub async fn start(client: &Client, chain: ResourceChain, config: ControllerConfig) {
    let ctx = Arc::new(Ctx {
        client: client.clone(),
        chain,
        config,
    });
    Controller::new(
        Api::<CertConfig>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .run(reconcile, error_policy, ctx)
    .for_each_concurrent(16, |res| async move {
        match res {
            Ok((cert_config, _)) => {
                debug!(cert_config = %cert_config, "Reconciled CertConfig");
            }
            Err(controller::Error::ReconcilerFailed(err, cert_config)) => {
                warn!(
                    cert_config = %cert_config,
                    error.category = err.category(),
                    error = &err as &dyn std::error::Error,
                    "Failed to reconcile CertConfig"
                );
            }
            Err(err) => {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "CertConfig controller failed"
                );
            }
        }
    })
    .await;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("CertConfig has no namespace"))]
    NoCertConfigNamespace,

    #[snafu(display("{cert_config} is invalid"))]
    InvalidCertConfig {
        source: InvalidRequestError,
        cert_config: ObjectRef<CertConfig>,
    },

    #[snafu(display("failed to update the finalizers of {cert_config}"))]
    UpdateFinalizers {
        source: kube::Error,
        cert_config: ObjectRef<CertConfig>,
    },

    #[snafu(display("failed to provision certificate for {cert_config}"))]
    EnsureCreated {
        source: ChainError,
        cert_config: ObjectRef<CertConfig>,
    },

    #[snafu(display("failed to clean up certificate for {cert_config}"))]
    EnsureDeleted {
        source: ChainError,
        cert_config: ObjectRef<CertConfig>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<kube::api::DynamicObject>> {
        None
    }
}

struct Ctx {
    client: Client,
    chain: ResourceChain,
    config: ControllerConfig,
}

async fn reconcile(cert_config: Arc<CertConfig>, ctx: Arc<Ctx>) -> Result<Action> {
    let cert_config_ref = ObjectRef::from_obj(&*cert_config);
    let api = Api::<CertConfig>::namespaced(
        ctx.client.as_kube_client(),
        cert_config
            .metadata
            .namespace
            .as_deref()
            .context(NoCertConfigNamespaceSnafu)?,
    );
    let has_finalizer = cert_config.finalizers().iter().any(|f| f == FINALIZER);
    let request = match CertificateRequest::try_from(&*cert_config) {
        Ok(request) => request,
        // Nothing can have been provisioned for an invalid request, so there is nothing to clean up
        Err(_) if cert_config.metadata.deletion_timestamp.is_some() => {
            if has_finalizer {
                remove_finalizer(&api, &cert_config).await?;
            }
            return Ok(Action::await_change());
        }
        Err(err) => {
            return Err(err).context(InvalidCertConfigSnafu {
                cert_config: cert_config_ref,
            })
        }
    };

    let pass = PassContext::default();
    if request.marked_for_deletion {
        if !has_finalizer {
            return Ok(Action::await_change());
        }
        ctx.chain
            .ensure_deleted(&pass, &request)
            .await
            .with_context(|_| EnsureDeletedSnafu {
                cert_config: cert_config_ref.clone(),
            })?;
        if pass.is_finalizer_kept() || pass.is_canceled() {
            info!(
                cert_config = %cert_config_ref,
                "Certificate cannot be cleaned up yet, keeping finalizer"
            );
            return Ok(Action::requeue(ctx.config.canceled_requeue_period));
        }
        remove_finalizer(&api, &cert_config).await?;
        info!(cert_config = %cert_config_ref, "Cleaned up certificate");
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        add_finalizer(&api, &cert_config).await?;
    }
    ctx.chain
        .ensure_created(&pass, &request)
        .await
        .with_context(|_| EnsureCreatedSnafu {
            cert_config: cert_config_ref,
        })?;
    Ok(Action::requeue(if pass.is_canceled() {
        ctx.config.canceled_requeue_period
    } else {
        ctx.config.resync_period
    }))
}

fn error_policy(_obj: Arc<CertConfig>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

async fn add_finalizer(api: &Api<CertConfig>, cert_config: &CertConfig) -> Result<()> {
    let mut finalizers = cert_config.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    set_finalizers(api, cert_config, finalizers).await
}

async fn remove_finalizer(api: &Api<CertConfig>, cert_config: &CertConfig) -> Result<()> {
    let finalizers = without_finalizer(cert_config.finalizers());
    set_finalizers(api, cert_config, finalizers).await
}

fn without_finalizer(finalizers: &[String]) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect()
}

/// Replaces the finalizers, failing if the object was modified since it was read
async fn set_finalizers(
    api: &Api<CertConfig>,
    cert_config: &CertConfig,
    finalizers: Vec<String>,
) -> Result<()> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": cert_config.resource_version(),
        }
    });
    api.patch(
        &cert_config.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .with_context(|_| UpdateFinalizersSnafu {
        cert_config: ObjectRef::from_obj(cert_config),
    })?;
    Ok(())
}
