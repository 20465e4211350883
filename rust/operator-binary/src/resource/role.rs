//! Maintains the signing role that the certificate of a request is issued under

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use super::{CertificateRequest, ErrorKind, PassContext, Patch, Resource, ResourceError};
use crate::backend::{role_name, BackendError, CaBackend, Role};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to search role {role:?} of cluster {cluster_id:?}"))]
    SearchRole {
        source: BackendError,
        cluster_id: String,
        role: String,
    },

    #[snafu(display("failed to create role {role:?} in cluster {cluster_id:?}"))]
    CreateRole {
        source: BackendError,
        cluster_id: String,
        role: String,
    },

    #[snafu(display("failed to update role {role:?} in cluster {cluster_id:?}"))]
    UpdateRole {
        source: BackendError,
        cluster_id: String,
        role: String,
    },
}

impl ResourceError for Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Unclassified
    }
}

/// Organizations of the request's certificate, the cluster component always comes first
pub fn desired_organizations(request: &CertificateRequest) -> Vec<String> {
    std::iter::once(request.cluster_component.clone())
        .chain(request.organizations.iter().cloned())
        .collect()
}

pub fn desired_role(request: &CertificateRequest) -> Role {
    let organizations = desired_organizations(request);
    Role {
        name: role_name(&organizations),
        allow_bare_domains: request.allow_bare_domains,
        allow_subdomains: true,
        allowed_domains: request.alt_names.clone(),
        organizations,
        ttl: request.ttl,
    }
}

pub struct RoleResource {
    backend: Arc<dyn CaBackend>,
}

impl RoleResource {
    pub fn new(backend: Arc<dyn CaBackend>) -> Self {
        Self { backend }
    }

    async fn search(&self, request: &CertificateRequest, name: &str) -> Result<Option<Role>, Error> {
        self.backend
            .search_role(&request.cluster_id, name)
            .await
            .context(SearchRoleSnafu {
                cluster_id: &request.cluster_id,
                role: name,
            })
    }
}

#[async_trait]
impl Resource for RoleResource {
    type State = Option<Role>;
    type Change = Role;
    type Error = Error;

    fn name(&self) -> &'static str {
        "role"
    }

    async fn current_state(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        let name = role_name(&desired_organizations(request));
        self.search(request, &name).await
    }

    async fn desired_state(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
    ) -> Result<Self::State, Self::Error> {
        Ok(Some(desired_role(request)))
    }

    async fn update_patch(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        Ok(match (current, desired) {
            (None, Some(desired)) => Patch::create(desired.clone()),
            (Some(current), Some(desired)) if current != desired => Patch::update(desired.clone()),
            _ => Patch::default(),
        })
    }

    async fn delete_patch(
        &self,
        _ctx: &PassContext,
        _request: &CertificateRequest,
        _current: &Self::State,
        _desired: &Self::State,
    ) -> Result<Patch<Self::Change>, Self::Error> {
        // Roles outlive their certificates, other requests of the cluster may share them
        Ok(Patch::default())
    }

    async fn apply_create(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        if self.search(request, &change.name).await?.is_some() {
            debug!(role = %change.name, "Role was created concurrently, leaving it to the next pass");
            return Ok(());
        }
        self.backend
            .create_role(&request.cluster_id, change)
            .await
            .context(CreateRoleSnafu {
                cluster_id: &request.cluster_id,
                role: &change.name,
            })?;
        info!(cluster.id = %request.cluster_id, role = %change.name, "Created role");
        Ok(())
    }

    async fn apply_update(
        &self,
        _ctx: &PassContext,
        request: &CertificateRequest,
        change: &Self::Change,
    ) -> Result<(), Self::Error> {
        self.backend
            .update_role(&request.cluster_id, change)
            .await
            .context(UpdateRoleSnafu {
                cluster_id: &request.cluster_id,
                role: &change.name,
            })?;
        info!(cluster.id = %request.cluster_id, role = %change.name, "Updated role");
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

#[cfg(test)]
mod tests {
    use stackable_operator::time::Duration;

    use super::{desired_role, RoleResource};
    use crate::{
        backend::role_name,
        resource::{testing::Fakes, PassContext, Resource},
    };

    #[test]
    fn desired_role_prepends_component() {
        let role = desired_role(&crate::resource::testing::request());
        assert!(role.allow_subdomains);
        assert_eq!(role.organizations, ["api", "system:masters"]);
        assert_eq!(role.name, role_name(&role.organizations));
        assert_eq!(role.ttl, Duration::from_hours_unchecked(24));
    }

    #[tokio::test]
    async fn role_is_created_then_left_alone() {
        let fakes = Fakes::new();
        let resource = RoleResource::new(fakes.backend.clone());
        let request = crate::resource::testing::request();
        let ctx = PassContext::default();

        let current = resource.current_state(&ctx, &request).await.unwrap();
        let desired = resource.desired_state(&ctx, &request).await.unwrap();
        let patch = resource
            .update_patch(&ctx, &request, &current, &desired)
            .await
            .unwrap();
        resource
            .apply_create(&ctx, &request, patch.create.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(fakes.backend.state().role_writes, 1);

        let current = resource.current_state(&ctx, &request).await.unwrap();
        assert_eq!(current, desired);
        assert!(resource
            .update_patch(&ctx, &request, &current, &desired)
            .await
            .unwrap()
            .is_empty());

        // A concurrently created role is not created twice
        resource
            .apply_create(&ctx, &request, patch.create.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(fakes.backend.state().role_writes, 1);
    }

    #[tokio::test]
    async fn changed_role_is_rewritten() {
        let fakes = Fakes::new();
        let resource = RoleResource::new(fakes.backend.clone());
        let mut request = crate::resource::testing::request();
        let ctx = PassContext::default();
        let role = desired_role(&request);
        fakes.backend.insert_role(&request.cluster_id, role);

        request.alt_names = vec!["al9qy.k8s.example.com".to_string()];
        let current = resource.current_state(&ctx, &request).await.unwrap();
        let desired = resource.desired_state(&ctx, &request).await.unwrap();
        let patch = resource
            .update_patch(&ctx, &request, &current, &desired)
            .await
            .unwrap();
        assert!(patch.create.is_none());
        let updated = patch.update.unwrap();
        assert_eq!(updated.allowed_domains, ["al9qy.k8s.example.com"]);
        resource.apply_update(&ctx, &request, &updated).await.unwrap();
        assert_eq!(
            resource.current_state(&ctx, &request).await.unwrap(),
            Some(updated)
        );
    }

    #[tokio::test]
    async fn roles_are_never_deleted() {
        let fakes = Fakes::new();
        let resource = RoleResource::new(fakes.backend.clone());
        let request = crate::resource::testing::request();
        let ctx = PassContext::default();
        let role = desired_role(&request);
        for current in [None, Some(role.clone())] {
            for desired in [None, Some(role.clone())] {
                assert!(resource
                    .delete_patch(&ctx, &request, &current, &desired)
                    .await
                    .unwrap()
                    .is_empty());
            }
        }
    }
}
