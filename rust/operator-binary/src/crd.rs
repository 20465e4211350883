//! The [`CertConfig`] custom resource, which declares a certificate to maintain for one component of a cluster

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
    time::Duration,
};

/// A CertConfig requests a leaf certificate for one component (such as `api` or `etcd`) of a cluster.
///
/// The operator keeps the certificate valid, reissuing it when it approaches expiry or when
/// the requested subject changes, and stores it in a Secret named `<clusterId>-<clusterComponent>`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "certs.stackable.tech",
    version = "v1alpha1",
    kind = "CertConfig",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertConfigSpec {
    /// The cluster that the certificate belongs to, each cluster has its own certificate authority.
    pub cluster_id: String,

    /// The component of the cluster that uses the certificate.
    pub cluster_component: String,

    /// The common name of the issued certificate.
    pub common_name: String,

    /// Additional DNS names of the issued certificate.
    #[serde(default)]
    pub alt_names: Vec<String>,

    /// IP addresses of the issued certificate.
    #[serde(default)]
    pub ip_sans: Vec<String>,

    /// Organizations of the issued certificate, the cluster component is always added in front.
    #[serde(default)]
    pub organizations: Vec<String>,

    /// Whether the signing role may issue certificates for the exact alt names (rather than only their subdomains).
    #[serde(default)]
    pub allow_bare_domains: bool,

    /// Lifetime of the issued certificate, such as `24h` or `90d`.
    pub ttl: Duration,

    /// Never reissue the certificate once it has been created.
    #[serde(default)]
    pub disable_regeneration: bool,

    /// Version of the release bundle that requested the certificate, copied to the Secret.
    #[serde(default)]
    pub version_bundle_version: String,
}
