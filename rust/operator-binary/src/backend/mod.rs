//! Certificate authority backends, which hold one root CA per cluster and issue leaf certificates
//! under signing roles

pub mod k8s_pki;

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use stackable_operator::time::Duration;

pub use k8s_pki::K8sPki;

use crate::utils::{sha256_hex, Unloggable};

/// A signing policy that leaf certificates are issued under
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    pub allow_bare_domains: bool,
    pub allow_subdomains: bool,
    pub allowed_domains: Vec<String>,
    pub organizations: Vec<String>,
    pub ttl: Duration,
}

/// Name of the role that issues certificates for `organizations`.
///
/// The name only depends on the set of organizations, so reordering (or repeating) them resolves to the same role.
pub fn role_name(organizations: &[String]) -> String {
    let mut organizations = organizations.iter().map(String::as_str).collect::<Vec<_>>();
    organizations.sort_unstable();
    organizations.dedup();
    format!("role-org-{}", sha256_hex(organizations.join(",").as_bytes()))
}

/// Parameters of a leaf certificate to be issued for a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueRequest {
    pub cluster_id: String,
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub ip_sans: Vec<String>,
    pub organizations: Vec<String>,
    pub ttl: Duration,
}

/// PEM-encoded material returned by [`CaBackend::issue_certificate`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub ca: String,
    pub certificate: String,
    pub private_key: Unloggable<String>,
}

/// Opaque error returned by a [`CaBackend`].
///
/// Backends don't classify their failures, so callers only get to see the message chain.
pub struct BackendError(Box<dyn std::error::Error + Send + Sync>);

impl BackendError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(MessageError {
            message: message.into(),
        })
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
struct MessageError {
    message: String,
}

impl Debug for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Operations that a certificate authority backend must support.
///
/// Implementations are shared between concurrently reconciled objects and must not keep
/// per-request state.
#[async_trait]
pub trait CaBackend: Send + Sync {
    async fn backend_exists(&self, cluster_id: &str) -> Result<bool, BackendError>;

    async fn ca_exists(&self, cluster_id: &str) -> Result<bool, BackendError>;

    /// Mounts the backend for a cluster, succeeds if it is already mounted.
    async fn create_backend(&self, cluster_id: &str) -> Result<(), BackendError>;

    /// Generates the root CA of a cluster, an existing CA is never replaced.
    async fn create_ca(&self, cluster_id: &str) -> Result<(), BackendError>;

    /// Removes the backend and everything stored in it.
    async fn delete_backend(&self, cluster_id: &str) -> Result<(), BackendError>;

    async fn search_role(&self, cluster_id: &str, name: &str)
        -> Result<Option<Role>, BackendError>;

    async fn create_role(&self, cluster_id: &str, role: &Role) -> Result<(), BackendError>;

    /// Replaces the whole role.
    async fn update_role(&self, cluster_id: &str, role: &Role) -> Result<(), BackendError>;

    /// Issues a leaf certificate under the role matching the request's organizations.
    async fn issue_certificate(
        &self,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate, BackendError>;

    /// Renews the credential that the operator uses to access the backend.
    async fn renew_own_token(&self) -> Result<(), BackendError>;

    /// Validates the operator's credential without modifying it.
    async fn lookup_own_token(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::{role_name, BackendError};
    use crate::utils::error_full_message;

    fn orgs(orgs: &[&str]) -> Vec<String> {
        orgs.iter().map(|org| org.to_string()).collect()
    }

    #[test]
    fn role_name_ignores_organization_order() {
        let blue_green = role_name(&orgs(&["blue", "green"]));
        assert_eq!(blue_green, role_name(&orgs(&["green", "blue"])));
        assert_eq!(blue_green, role_name(&orgs(&["green", "blue", "green"])));
        assert_ne!(blue_green, role_name(&orgs(&["blue", "green", "red"])));
        assert_ne!(blue_green, role_name(&orgs(&["blue"])));
        assert!(blue_green.starts_with("role-org-"));
    }

    #[test]
    fn backend_error_keeps_message_chain() {
        let err = BackendError::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(error_full_message(&err), "connection refused");
        assert_eq!(
            BackendError::from_message("permission denied").to_string(),
            "permission denied"
        );
    }
}
