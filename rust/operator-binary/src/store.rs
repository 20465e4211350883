//! Access to the Kubernetes objects that certificates are delivered through, and to the workloads that use them

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::core::v1::{Pod, Secret},
    kube::{
        self,
        api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
        runtime::reflector::ObjectRef,
    },
};

use crate::utils::Unloggable;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("{secret} already exists"))]
    AlreadyExists { secret: ObjectRef<Secret> },

    #[snafu(display("object is missing key {key:?}"))]
    MissingObjectKey { key: &'static str },

    #[snafu(display("failed to get {secret}"))]
    GetSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to create {secret}"))]
    CreateSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to apply {secret}"))]
    ApplySecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to delete {secret}"))]
    DeleteSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to list pods in namespace {namespace:?}"))]
    ListPods {
        source: kube::Error,
        namespace: String,
    },
}

/// Persists certificate Secrets, keyed by name and namespace
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `None` if the Secret does not exist.
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<Secret>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] if the Secret exists already.
    async fn create(&self, secret: &Secret) -> Result<(), StoreError>;

    async fn update(&self, secret: &Secret) -> Result<(), StoreError>;

    /// Succeeds if the Secret does not exist.
    async fn delete(&self, name: &str, namespace: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PodLister: Send + Sync {
    /// Counts the pods in `namespace` that have not terminated.
    async fn live_pods(&self, namespace: &str) -> Result<usize, StoreError>;
}

pub struct KubeSecretStore {
    client: Unloggable<Client>,
    field_manager: String,
}

impl KubeSecretStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client: Unloggable(client),
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.as_kube_client(), namespace)
    }
}

fn secret_key(secret: &Secret) -> Result<(&str, &str), StoreError> {
    let name = secret
        .metadata
        .name
        .as_deref()
        .context(MissingObjectKeySnafu {
            key: "metadata.name",
        })?;
    let namespace = secret
        .metadata
        .namespace
        .as_deref()
        .context(MissingObjectKeySnafu {
            key: "metadata.namespace",
        })?;
    Ok((name, namespace))
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<Secret>, StoreError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .context(GetSecretSnafu {
                secret: ObjectRef::new(name).within(namespace),
            })
    }

    async fn create(&self, secret: &Secret) -> Result<(), StoreError> {
        let (name, namespace) = secret_key(secret)?;
        let secret_ref = ObjectRef::new(name).within(namespace);
        match self
            .api(namespace)
            .create(&PostParams::default(), secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                AlreadyExistsSnafu { secret: secret_ref }.fail()
            }
            Err(err) => Err(err).context(CreateSecretSnafu { secret: secret_ref }),
        }
    }

    async fn update(&self, secret: &Secret) -> Result<(), StoreError> {
        let (name, namespace) = secret_key(secret)?;
        self.api(namespace)
            .patch(
                name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(secret),
            )
            .await
            .context(ApplySecretSnafu {
                secret: ObjectRef::new(name).within(namespace),
            })?;
        Ok(())
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err).context(DeleteSecretSnafu {
                secret: ObjectRef::new(name).within(namespace),
            }),
        }
    }
}

pub struct KubePodLister {
    client: Unloggable<Client>,
}

impl KubePodLister {
    pub fn new(client: Client) -> Self {
        Self {
            client: Unloggable(client),
        }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn live_pods(&self, namespace: &str) -> Result<usize, StoreError> {
        let pods = Api::<Pod>::namespaced(self.client.as_kube_client(), namespace)
            .list(&ListParams::default())
            .await
            .context(ListPodsSnafu { namespace })?;
        Ok(pods.items.iter().filter(|pod| is_live(pod)).count())
    }
}

/// Whether the pod may still be running, pods that have not reported a phase yet count as live.
fn is_live(pod: &Pod) -> bool {
    !matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}
