use crate::{
    error::{AuthzError, StoreError},
    models::{Id, User},
    pipeline::RequestContext,
    repository::RepositoryState,
};

/// Role names referenced by route policies.
pub const ROLE_USER: &str = "user";
pub const ROLE_MODERATOR: &str = "moderator";
pub const ROLE_ADMIN: &str = "admin";

/// AuthorizationGate
///
/// Two-tier decision for ownership-sensitive operations:
/// - the owner of a resource is always allowed, before any role lookup;
/// - anyone else needs a role whose level is at least the required role's level.
#[derive(Clone)]
pub struct AuthorizationGate {
    repo: RepositoryState,
}

impl AuthorizationGate {
    pub fn new(repo: RepositoryState) -> Self {
        Self { repo }
    }

    /// authorize
    ///
    /// `resource_owner` is `None` for resources with no owner shortcut (e.g. role
    /// administration). An unknown `required_role` is a configuration fault and is
    /// reported as `RoleLookupFailed`, never as a deny.
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        user: &User,
        resource_owner: Option<Id>,
        required_role: &str,
    ) -> Result<(), AuthzError> {
        if resource_owner == Some(user.id) {
            return Ok(());
        }

        let role = ctx
            .run(self.repo.get_role_by_name(required_role))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => AuthzError::RoleLookupFailed(required_role.to_string()),
                StoreError::DeadlineExceeded => AuthzError::DeadlineExceeded,
                other => AuthzError::StoreUnavailable(other.to_string()),
            })?;

        if user.role.level >= role.level {
            Ok(())
        } else {
            tracing::info!(
                user_id = user.id,
                user_role = %user.role.name,
                required_role = %role.name,
                "authorization denied"
            );
            Err(AuthzError::Forbidden)
        }
    }
}
