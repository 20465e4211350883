//! In-memory stand-ins for the backend, the stores, and the clock

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret, kube::runtime::reflector::ObjectRef, time::Duration,
};
use time::OffsetDateTime;

use super::{
    access::AccessGuard,
    cert::{self, CertResource, CertResourceConfig, CertificateSecret},
    chain::{CrudStep, ResourceChain},
    pki::PkiResource,
    role::{desired_role, RoleResource},
    CertificateRequest, PassContext, Resource,
};
use crate::{
    backend::{role_name, BackendError, CaBackend, IssueRequest, IssuedCertificate, Role},
    store::{PodLister, SecretStore, StoreError},
    utils::{Clock, Unloggable},
};

pub const NAMESPACE: &str = "default";

/// 2024-03-01T12:00:00Z
pub const START: i64 = 1_709_294_400;

/// The request of the `api` component of cluster `al9qy`
pub fn request() -> CertificateRequest {
    CertificateRequest {
        cluster_id: "al9qy".to_string(),
        cluster_component: "api".to_string(),
        common_name: "api.al9qy.k8s.example.com".to_string(),
        alt_names: vec![],
        ip_sans: vec![],
        organizations: vec!["system:masters".to_string()],
        allow_bare_domains: false,
        ttl: Duration::from_hours_unchecked(24),
        disable_regeneration: false,
        version_bundle_version: "1.0.0".to_string(),
        marked_for_deletion: false,
    }
}

#[derive(Debug, Default)]
pub struct FakeBackendState {
    pub mounted: BTreeSet<String>,
    pub cas: BTreeSet<String>,
    /// Keyed by cluster and role name
    pub roles: BTreeMap<(String, String), Role>,
    pub issued: Vec<IssueRequest>,
    pub role_writes: usize,
    pub ca_generations: usize,
    pub token_renewals: usize,
    pub token_lookups: usize,
    /// Fails all token operations with this message
    pub token_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeCaBackend {
    state: Mutex<FakeBackendState>,
}

impl FakeCaBackend {
    pub fn state(&self) -> MutexGuard<'_, FakeBackendState> {
        self.state.lock().unwrap()
    }

    pub fn mount(&self, cluster_id: &str) {
        self.state().mounted.insert(cluster_id.to_string());
    }

    pub fn insert_role(&self, cluster_id: &str, role: Role) {
        self.state()
            .roles
            .insert((cluster_id.to_string(), role.name.clone()), role);
    }

    fn token_result(state: &FakeBackendState) -> Result<(), BackendError> {
        match &state.token_error {
            Some(message) => Err(BackendError::from_message(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CaBackend for FakeCaBackend {
    async fn backend_exists(&self, cluster_id: &str) -> Result<bool, BackendError> {
        Ok(self.state().mounted.contains(cluster_id))
    }

    async fn ca_exists(&self, cluster_id: &str) -> Result<bool, BackendError> {
        Ok(self.state().cas.contains(cluster_id))
    }

    async fn create_backend(&self, cluster_id: &str) -> Result<(), BackendError> {
        self.mount(cluster_id);
        Ok(())
    }

    async fn create_ca(&self, cluster_id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        if !state.mounted.contains(cluster_id) {
            return Err(BackendError::from_message("backend is not mounted"));
        }
        if state.cas.insert(cluster_id.to_string()) {
            state.ca_generations += 1;
        }
        Ok(())
    }

    async fn delete_backend(&self, cluster_id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.mounted.remove(cluster_id);
        state.cas.remove(cluster_id);
        state.roles.retain(|(cluster, _), _| cluster != cluster_id);
        Ok(())
    }

    async fn search_role(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<Role>, BackendError> {
        Ok(self
            .state()
            .roles
            .get(&(cluster_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_role(&self, cluster_id: &str, role: &Role) -> Result<(), BackendError> {
        let mut state = self.state();
        let key = (cluster_id.to_string(), role.name.clone());
        if state.roles.contains_key(&key) {
            return Err(BackendError::from_message("role already exists"));
        }
        state.roles.insert(key, role.clone());
        state.role_writes += 1;
        Ok(())
    }

    async fn update_role(&self, cluster_id: &str, role: &Role) -> Result<(), BackendError> {
        let mut state = self.state();
        let key = (cluster_id.to_string(), role.name.clone());
        if !state.roles.contains_key(&key) {
            return Err(BackendError::from_message("role does not exist"));
        }
        state.roles.insert(key, role.clone());
        state.role_writes += 1;
        Ok(())
    }

    async fn issue_certificate(
        &self,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate, BackendError> {
        let mut state = self.state();
        if !state.cas.contains(&request.cluster_id) {
            return Err(BackendError::from_message("cluster has no CA"));
        }
        let role = (
            request.cluster_id.clone(),
            role_name(&request.organizations),
        );
        if !state.roles.contains_key(&role) {
            return Err(BackendError::from_message("role does not exist"));
        }
        state.issued.push(request.clone());
        let serial = state.issued.len();
        Ok(IssuedCertificate {
            ca: format!("ca-{}", request.cluster_id),
            certificate: format!("crt-{serial}"),
            private_key: Unloggable(format!("key-{serial}")),
        })
    }

    async fn renew_own_token(&self) -> Result<(), BackendError> {
        let mut state = self.state();
        state.token_renewals += 1;
        Self::token_result(&state)
    }

    async fn lookup_own_token(&self) -> Result<(), BackendError> {
        let mut state = self.state();
        state.token_lookups += 1;
        Self::token_result(&state)
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
}

impl MemorySecretStore {
    pub fn raw(&self, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn stored(&self, name: &str) -> Option<CertificateSecret> {
        self.raw(name)
            .map(|secret| CertificateSecret::from_secret(secret).unwrap())
    }

    pub fn put(&self, secret: &CertificateSecret) {
        self.secrets.lock().unwrap().insert(
            (secret.namespace.clone(), secret.name.clone()),
            secret.to_secret(),
        );
    }
}

fn key(secret: &Secret) -> (String, String) {
    (
        secret.metadata.namespace.clone().unwrap_or_default(),
        secret.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, secret: &Secret) -> Result<(), StoreError> {
        let mut secrets = self.secrets.lock().unwrap();
        let (namespace, name) = key(secret);
        if secrets.contains_key(&(namespace.clone(), name.clone())) {
            return Err(StoreError::AlreadyExists {
                secret: ObjectRef::new(&name).within(&namespace),
            });
        }
        secrets.insert((namespace, name), secret.clone());
        Ok(())
    }

    async fn update(&self, secret: &Secret) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .unwrap()
            .insert(key(secret), secret.clone());
        Ok(())
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakePods {
    live: AtomicUsize,
    calls: AtomicUsize,
}

impl FakePods {
    pub fn set_live(&self, live: usize) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodLister for FakePods {
    async fn live_pods(&self, _namespace: &str) -> Result<usize, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.live.load(Ordering::SeqCst))
    }
}

#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn at(unix_timestamp: i64) -> Self {
        Self {
            now: Mutex::new(OffsetDateTime::from_unix_timestamp(unix_timestamp).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

pub struct Fakes {
    pub backend: Arc<FakeCaBackend>,
    pub secrets: Arc<MemorySecretStore>,
    pub pods: Arc<FakePods>,
    pub clock: Arc<FixedClock>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            backend: Arc::default(),
            secrets: Arc::default(),
            pods: Arc::default(),
            clock: Arc::new(FixedClock::at(START)),
        }
    }

    pub fn cert_config() -> CertResourceConfig {
        CertResourceConfig::new(NAMESPACE, "0.1.0")
    }

    pub fn cert_resource_with(
        &self,
        config: CertResourceConfig,
    ) -> Result<CertResource, cert::Error> {
        CertResource::new(
            self.backend.clone(),
            self.secrets.clone(),
            self.pods.clone(),
            self.clock.clone(),
            config,
        )
    }

    pub fn cert_resource(&self) -> CertResource {
        self.cert_resource_with(Self::cert_config()).unwrap()
    }

    pub fn chain(&self) -> ResourceChain {
        ResourceChain::new(
            AccessGuard::new(self.backend.clone()),
            CrudStep(PkiResource::new(self.backend.clone())),
            CrudStep(RoleResource::new(self.backend.clone())),
            CrudStep(self.cert_resource()),
        )
    }

    /// [`request`], with the PKI and role that it needs already in place
    pub fn prepared_request(&self) -> CertificateRequest {
        let request = request();
        self.backend.mount(&request.cluster_id);
        self.backend
            .state()
            .cas
            .insert(request.cluster_id.clone());
        self.backend
            .insert_role(&request.cluster_id, desired_role(&request));
        request
    }

    /// Runs a full create pass of `resource`, and returns the Secret it created.
    pub async fn converge_cert(
        &self,
        resource: &CertResource,
        request: &CertificateRequest,
    ) -> CertificateSecret {
        let ctx = PassContext::default();
        let current = resource.current_state(&ctx, request).await.unwrap();
        let desired = resource.desired_state(&ctx, request).await.unwrap();
        let created = resource
            .update_patch(&ctx, request, &current, &desired)
            .await
            .unwrap()
            .create
            .unwrap();
        resource
            .apply_create(&ctx, request, &created)
            .await
            .unwrap();
        created
    }
}
