//! Makes sure that each cluster has a CA backend and a root CA

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use super::{CertificateRequest, ErrorKind, PassContext, Patch, Resource, ResourceError};
use crate::backend::{BackendError, CaBackend};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to check whether the backend of cluster {cluster_id:?} is mounted"))]
    CheckBackend {
        source: BackendError,
        cluster_id: String,
    },

    #[snafu(display("failed to check whether cluster {cluster_id:?} has a root CA"))]
    CheckCa {
        source: BackendError,
        cluster_id: String,
    },

    #[snafu(display("failed to mount the backend of cluster {cluster_id:?}"))]
    CreateBackend {
        source: BackendError,
        cluster_id: String,
    },

    #[snafu(display("failed to generate the root CA of cluster {cluster_id:?}"))]
    CreateCa {
        source: BackendError,
        cluster_id: String,
    },
}

impl ResourceError for Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Unclassified
    }
}

/// What exists of a cluster's PKI.
///
/// As a change, `true` marks the parts that must be created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PkiState {
    pub backend_mounted: bool,
    pub root_ca_present: bool,
}

pub struct PkiResource {
    backend: Arc<dyn CaBackend>,
}

impl PkiResource {
    pub fn new(backend: Arc<dyn CaBackend>) -> Self {
        Self { backend }
    }

    async fn backend_exists(&self, cluster_id: &str) -> Result<bool, Error> {
        self.backend
            .backend_exists(cluster_id)
            .await
            .context(CheckBackendSnafu { cluster_id })
    }

    async fn ca_exists(&self, cluster_id: &str) -> Result<bool, Error> {
        self.backend
            .ca_exists(cluster_id)
            .await
            .context(CheckCaSnafu { cluster_id })
    }
}

#[async_trait]
impl Resource for PkiResource {
    type State = PkiState;
    type Change = PkiState;
    type Error = Error;

    fn name(&self) -> &'static str {
        "pki"
    }

    async fn current_state(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        let backend_mounted = self.backend_exists(&request.cluster_id).await?;
        // There can be no CA without a backend to keep it in
        let root_ca_present = backend_mounted && self.ca_exists(&request.cluster_id).await?;
        Ok(PkiState {
            backend_mounted,
            root_ca_present,
        })
    }

    async fn desired_state(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        Ok(PkiState {
            backend_mounted: true,
            root_ca_present: true,
        })
    }

    async fn update_patch(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        let missing = PkiState {
            backend_mounted: desired.backend_mounted && !current.backend_mounted,
            root_ca_present: desired.root_ca_present && !current.root_ca_present,
        };
        Ok(if missing == PkiState::default() {
            Patch::default()
        } else {
            Patch::create(missing)
        })
    }

    async fn delete_patch(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        _current: &Self::State,
        _desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        // The root CA must survive for as long as any certificate it signed may be in use
        Ok(Patch::default())
    }

    async fn apply_create(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        let cluster_id = &request.cluster_id;
        if change.backend_mounted {
            if self.backend_exists(cluster_id).await? {
                debug!(cluster.id = %cluster_id, "PKI backend was mounted concurrently");
            } else {
                self.backend
                    .create_backend(cluster_id)
                    .await
                    .context(CreateBackendSnafu { cluster_id })?;
                info!(cluster.id = %cluster_id, "Mounted PKI backend");
            }
        }
        if change.root_ca_present {
            if self.ca_exists(cluster_id).await? {
                debug!(cluster.id = %cluster_id, "Root CA was generated concurrently");
            } else {
                self.backend
                    .create_ca(cluster_id)
                    .await
                    .context(CreateCaSnafu { cluster_id })?;
                info!(cluster.id = %cluster_id, "Generated root CA");
            }
        }
        Ok(())
    }

    async fn apply_update(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        _change: &Self::Change,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn apply_delete(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        _change: &Self::Change,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}
