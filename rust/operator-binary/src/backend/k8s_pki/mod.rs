//! Keeps the certificate authority of each cluster in a Kubernetes [`Secret`]
//!
//! The Secret `pki-<cluster>` is the cluster's backend. It holds the root CA in `ca.crt`/`ca.key`,
//! and each signing role as JSON under `role.<name>`.

mod ca;

use std::{cmp::min, collections::BTreeMap};

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{
        self,
        api::{Api, DeleteParams, ObjectMeta, PostParams},
        runtime::reflector::ObjectRef,
    },
    time::Duration,
};
use tracing::{debug, info};

use super::{role_name, BackendError, CaBackend, IssueRequest, IssuedCertificate, Role};
use self::ca::CertificateAuthority;
use crate::utils::Unloggable;

const SECRET_KEY_ROLE_PREFIX: &str = "role.";
const LABEL_PKI_CLUSTER: &str = "certs.stackable.tech/pki-cluster";

/// Lifetime of generated root CAs.
pub const DEFAULT_CA_LIFETIME: Duration = Duration::from_days_unchecked(10 * 365);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get backend {secret}"))]
    GetBackend {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to create backend {secret}"))]
    CreateBackend {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to delete backend {secret}"))]
    DeleteBackend {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to save backend {secret}"))]
    SaveBackend {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("backend {secret} is not mounted"))]
    BackendNotMounted { secret: ObjectRef<Secret> },

    #[snafu(display("failed to generate CA for cluster {cluster_id:?}"))]
    GenerateCa {
        source: ca::Error,
        cluster_id: String,
    },

    #[snafu(display("failed to load CA from {secret}"))]
    LoadCa {
        source: ca::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to issue certificate under {role:?}"))]
    IssueCertificate { source: ca::Error, role: String },

    #[snafu(display("failed to parse role {key:?} of {secret}"))]
    ParseRole {
        source: serde_json::Error,
        key: String,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to serialize role {role:?}"))]
    SerializeRole {
        source: serde_json::Error,
        role: String,
    },

    #[snafu(display("role {role:?} already exists in {secret}"))]
    RoleAlreadyExists {
        role: String,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("role {role:?} does not exist in {secret}"))]
    RoleNotFound {
        role: String,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("role {role:?} does not allow organization {organization:?}"))]
    OrganizationNotAllowed { role: String, organization: String },

    #[snafu(display("failed to reach the Kubernetes API server"))]
    ProbeApiServer { source: kube::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for BackendError {
    fn from(err: Error) -> Self {
        BackendError::new(err)
    }
}

pub struct K8sPki {
    // Not secret per se, but Client isn't Debug
    client: Unloggable<stackable_operator::client::Client>,
    namespace: String,
    ca_lifetime: Duration,
}

impl K8sPki {
    pub fn new(
        client: stackable_operator::client::Client,
        namespace: impl Into<String>,
        ca_lifetime: Duration,
    ) -> Self {
        Self {
            client: Unloggable(client),
            namespace: namespace.into(),
            ca_lifetime,
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.as_kube_client(), &self.namespace)
    }

    fn secret_ref(&self, cluster_id: &str) -> ObjectRef<Secret> {
        ObjectRef::new(&backend_secret_name(cluster_id)).within(&self.namespace)
    }

    async fn get_backend(&self, cluster_id: &str) -> Result<Option<Secret>> {
        self.api()
            .get_opt(&backend_secret_name(cluster_id))
            .await
            .with_context(|_| GetBackendSnafu {
                secret: self.secret_ref(cluster_id),
            })
    }

    async fn get_mounted_backend(&self, cluster_id: &str) -> Result<Secret> {
        self.get_backend(cluster_id)
            .await?
            .with_context(|| BackendNotMountedSnafu {
                secret: self.secret_ref(cluster_id),
            })
    }

    /// Writes back a backend Secret that was previously read, so concurrent modifications fail rather than get lost.
    async fn save_backend(&self, cluster_id: &str, secret: &Secret) -> Result<()> {
        self.api()
            .replace(
                &backend_secret_name(cluster_id),
                &PostParams::default(),
                secret,
            )
            .await
            .with_context(|_| SaveBackendSnafu {
                secret: self.secret_ref(cluster_id),
            })?;
        Ok(())
    }

    async fn write_role(&self, cluster_id: &str, role: &Role, must_exist: bool) -> Result<()> {
        let mut backend = self.get_mounted_backend(cluster_id).await?;
        let key = role_key(&role.name);
        let data = backend.data.get_or_insert_with(BTreeMap::new);
        match (data.contains_key(&key), must_exist) {
            (true, false) => {
                return RoleAlreadyExistsSnafu {
                    role: &role.name,
                    secret: self.secret_ref(cluster_id),
                }
                .fail()
            }
            (false, true) => {
                return RoleNotFoundSnafu {
                    role: &role.name,
                    secret: self.secret_ref(cluster_id),
                }
                .fail()
            }
            _ => {}
        }
        data.insert(
            key,
            ByteString(serde_json::to_vec(role).context(SerializeRoleSnafu { role: &role.name })?),
        );
        self.save_backend(cluster_id, &backend).await
    }

    fn find_role(&self, cluster_id: &str, backend: &Secret, name: &str) -> Result<Option<Role>> {
        let key = role_key(name);
        backend
            .data
            .as_ref()
            .and_then(|data| data.get(&key))
            .map(|ByteString(role)| {
                serde_json::from_slice(role).with_context(|_| ParseRoleSnafu {
                    key: &key,
                    secret: self.secret_ref(cluster_id),
                })
            })
            .transpose()
    }
}

#[async_trait]
impl CaBackend for K8sPki {
    async fn backend_exists(&self, cluster_id: &str) -> Result<bool, BackendError> {
        Ok(self.get_backend(cluster_id).await?.is_some())
    }

    async fn ca_exists(&self, cluster_id: &str) -> Result<bool, BackendError> {
        Ok(self
            .get_backend(cluster_id)
            .await?
            .and_then(|backend| backend.data)
            .is_some_and(|data| has_ca(&data)))
    }

    async fn create_backend(&self, cluster_id: &str) -> Result<(), BackendError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(backend_secret_name(cluster_id)),
                namespace: Some(self.namespace.clone()),
                labels: Some([(LABEL_PKI_CLUSTER.to_string(), cluster_id.to_string())].into()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        match self.api().create(&PostParams::default(), &secret).await {
            Ok(_) => {
                info!(secret = %self.secret_ref(cluster_id), "Mounted PKI backend");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                debug!(secret = %self.secret_ref(cluster_id), "PKI backend is already mounted");
                Ok(())
            }
            Err(err) => Err(Error::CreateBackend {
                source: err,
                secret: self.secret_ref(cluster_id),
            }
            .into()),
        }
    }

    async fn create_ca(&self, cluster_id: &str) -> Result<(), BackendError> {
        let mut backend = self.get_mounted_backend(cluster_id).await?;
        let data = backend.data.get_or_insert_with(BTreeMap::new);
        if has_ca(data) {
            debug!(secret = %self.secret_ref(cluster_id), "CA already exists, not regenerating it");
            return Ok(());
        }
        let ca = CertificateAuthority::new_self_signed(cluster_id, self.ca_lifetime)
            .and_then(|ca| ca.to_secret_data())
            .context(GenerateCaSnafu { cluster_id })?;
        data.extend(ca);
        self.save_backend(cluster_id, &backend).await?;
        info!(
            secret = %self.secret_ref(cluster_id),
            ca.lifetime = %self.ca_lifetime,
            "Generated root CA"
        );
        Ok(())
    }

    async fn delete_backend(&self, cluster_id: &str) -> Result<(), BackendError> {
        match self
            .api()
            .delete(&backend_secret_name(cluster_id), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(Error::DeleteBackend {
                source: err,
                secret: self.secret_ref(cluster_id),
            }
            .into()),
        }
    }

    async fn search_role(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<Role>, BackendError> {
        match self.get_backend(cluster_id).await? {
            Some(backend) => Ok(self.find_role(cluster_id, &backend, name)?),
            None => Ok(None),
        }
    }

    async fn create_role(&self, cluster_id: &str, role: &Role) -> Result<(), BackendError> {
        Ok(self.write_role(cluster_id, role, false).await?)
    }

    async fn update_role(&self, cluster_id: &str, role: &Role) -> Result<(), BackendError> {
        Ok(self.write_role(cluster_id, role, true).await?)
    }

    async fn issue_certificate(
        &self,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate, BackendError> {
        let cluster_id = &request.cluster_id;
        let backend = self.get_mounted_backend(cluster_id).await?;
        let name = role_name(&request.organizations);
        let role = self
            .find_role(cluster_id, &backend, &name)?
            .with_context(|| RoleNotFoundSnafu {
                role: &name,
                secret: self.secret_ref(cluster_id),
            })?;
        let lifetime = authorize(&role, request)?;
        let ca = CertificateAuthority::from_secret_data(
            backend.data.as_ref().unwrap_or(&BTreeMap::new()),
        )
        .with_context(|_| LoadCaSnafu {
            secret: self.secret_ref(cluster_id),
        })?;
        Ok(ca
            .issue(request, lifetime)
            .context(IssueCertificateSnafu { role: &name })?)
    }

    async fn renew_own_token(&self) -> Result<(), BackendError> {
        // The operator authenticates with its ServiceAccount token, which the kubelet rotates for us
        self.lookup_own_token().await
    }

    async fn lookup_own_token(&self) -> Result<(), BackendError> {
        self.client
            .as_kube_client()
            .apiserver_version()
            .await
            .context(ProbeApiServerSnafu)?;
        Ok(())
    }
}

/// Checks the request against the role, and returns the lifetime of the certificate to issue.
fn authorize(role: &Role, request: &IssueRequest) -> Result<Duration> {
    if let Some(organization) = request
        .organizations
        .iter()
        .find(|org| !role.organizations.contains(org))
    {
        return OrganizationNotAllowedSnafu {
            role: &role.name,
            organization,
        }
        .fail();
    }
    Ok(min(request.ttl, role.ttl))
}

fn backend_secret_name(cluster_id: &str) -> String {
    format!("pki-{cluster_id}")
}

fn role_key(name: &str) -> String {
    format!("{SECRET_KEY_ROLE_PREFIX}{name}")
}

fn has_ca(data: &BTreeMap<String, ByteString>) -> bool {
    data.contains_key(ca::SECRET_KEY_CA_CERT) && data.contains_key(ca::SECRET_KEY_CA_KEY)
}

#[cfg(test)]
mod tests {
    use stackable_operator::time::Duration;

    use super::{authorize, backend_secret_name, role_key, Error};
    use crate::backend::{role_name, IssueRequest, Role};

    fn role() -> Role {
        let organizations = vec!["api".to_string(), "system:masters".to_string()];
        Role {
            name: role_name(&organizations),
            allow_bare_domains: false,
            allow_subdomains: true,
            allowed_domains: vec![],
            organizations,
            ttl: Duration::from_hours_unchecked(24),
        }
    }

    fn request(organizations: &[&str], ttl: Duration) -> IssueRequest {
        IssueRequest {
            cluster_id: "al9qy".to_string(),
            common_name: "api.al9qy.k8s.example.com".to_string(),
            alt_names: vec![],
            ip_sans: vec![],
            organizations: organizations.iter().map(|org| org.to_string()).collect(),
            ttl,
        }
    }

    #[test]
    fn authorize_caps_lifetime_at_role_ttl() {
        assert_eq!(
            authorize(
                &role(),
                &request(&["api", "system:masters"], Duration::from_days_unchecked(7))
            )
            .unwrap(),
            Duration::from_hours_unchecked(24)
        );
        assert_eq!(
            authorize(&role(), &request(&["api"], Duration::from_hours_unchecked(1))).unwrap(),
            Duration::from_hours_unchecked(1)
        );
    }

    #[test]
    fn authorize_rejects_foreign_organizations() {
        assert!(matches!(
            authorize(
                &role(),
                &request(&["api", "system:nodes"], Duration::from_hours_unchecked(1))
            ),
            Err(Error::OrganizationNotAllowed { organization, .. }) if organization == "system:nodes"
        ));
    }

    #[test]
    fn secret_layout() {
        assert_eq!(backend_secret_name("al9qy"), "pki-al9qy");
        assert_eq!(role_key("role-org-abc"), "role.role-org-abc");
    }
}
