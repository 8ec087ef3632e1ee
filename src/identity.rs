use crate::{
    cache::CacheState,
    config::CachePolicy,
    error::{CacheError, ResolveError, StoreError},
    models::{Id, User},
    pipeline::RequestContext,
    repository::RepositoryState,
};

/// IdentityResolver
///
/// Cache-aside lookup of the full identity behind a token subject.
///
/// The cache holds disposable replicas with a bounded lifetime; the repository is
/// the source of truth. A cache outage is reported as such and never papered over
/// with a store read.
#[derive(Clone)]
pub struct IdentityResolver {
    cache: CacheState,
    repo: RepositoryState,
    policy: CachePolicy,
}

impl IdentityResolver {
    pub fn new(cache: CacheState, repo: RepositoryState, policy: CachePolicy) -> Self {
        Self {
            cache,
            repo,
            policy,
        }
    }

    pub fn cache_key(id: Id) -> String {
        format!("user-{}", id)
    }

    /// resolve
    ///
    /// 1. Cache hit: return the replica, no store access.
    /// 2. Explicit miss: read the store, write the user back with the policy TTL.
    /// 3. Cache error: surface it; the store is not consulted.
    ///
    /// Two concurrent misses for the same id both write the same value back, which
    /// is an idempotent overwrite.
    pub async fn resolve(&self, ctx: &RequestContext, id: Id) -> Result<User, ResolveError> {
        let key = Self::cache_key(id);

        let cached = ctx
            .run(self.cache.get(&key))
            .await
            .map_err(resolve_cache_error)?;

        if let Some(payload) = cached {
            return serde_json::from_str::<User>(&payload).map_err(|e| {
                tracing::error!(user_id = id, "corrupt identity cache entry: {:?}", e);
                ResolveError::CacheUnavailable(format!("corrupt cache entry for {key}"))
            });
        }

        tracing::debug!(user_id = id, "identity cache miss");

        let user = ctx
            .run(self.repo.get_user_by_id(id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => ResolveError::NotFound,
                StoreError::DeadlineExceeded => ResolveError::DeadlineExceeded,
                other => ResolveError::StoreUnavailable(other.to_string()),
            })?;

        let payload = serde_json::to_string(&user)
            .map_err(|e| ResolveError::CacheUnavailable(e.to_string()))?;
        ctx.run(self.cache.set_with_ttl(&key, &payload, self.policy.ttl))
            .await
            .map_err(resolve_cache_error)?;

        Ok(user)
    }

    /// invalidate
    ///
    /// Drops the cached replica for `id`.
    pub async fn invalidate(&self, ctx: &RequestContext, id: Id) -> Result<(), CacheError> {
        ctx.run(self.cache.delete(&Self::cache_key(id))).await
    }

    /// identity_written
    ///
    /// Hook called by the mutation coordinator after it changes an identity.
    /// Applies the configured policy: with invalidation off the replica simply
    /// ages out. A failed invalidation is logged and does not fail the write.
    pub async fn identity_written(&self, ctx: &RequestContext, id: Id) {
        if !self.policy.invalidate_on_write {
            return;
        }
        if let Err(e) = self.invalidate(ctx, id).await {
            tracing::warn!(user_id = id, "identity cache invalidation failed: {}", e);
        }
    }
}

fn resolve_cache_error(err: CacheError) -> ResolveError {
    match err {
        CacheError::Unavailable(detail) => ResolveError::CacheUnavailable(detail),
        CacheError::DeadlineExceeded => ResolveError::DeadlineExceeded,
    }
}
