use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;

use crate::{
    AppConfig,
    auth::{AuthUser, TokenCodec, bearer_token},
    authz::AuthorizationGate,
    cache::CacheState,
    error::{ApiError, DeadlineError, ResolveError},
    identity::IdentityResolver,
    models::Id,
    ratelimit::{FixedWindowLimiter, client_key},
    repository::RepositoryState,
};

/// RequestContext
///
/// Carries the request's deadline through every stage. Each stage awaits its
/// downstream call through `run`, so once the deadline passes nothing further
/// executes and the stage reports `DeadlineExceeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    deadline: Instant,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline }
    }

    /// from_parts
    ///
    /// The context installed by `request_context_middleware`, or a fresh one when
    /// the extractor runs outside the middleware stack (e.g. in tests).
    pub fn from_parts(parts: &Parts, timeout: Duration) -> Self {
        parts
            .extensions
            .get::<RequestContext>()
            .copied()
            .unwrap_or_else(|| Self::new(timeout))
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// narrowed
    ///
    /// A child context that expires after `limit` or at the parent deadline,
    /// whichever comes first.
    pub fn narrowed(&self, limit: Duration) -> Self {
        Self {
            deadline: self.deadline.min(Instant::now() + limit),
        }
    }

    /// run
    ///
    /// Awaits `fut` until the deadline. On expiry the future is dropped and the
    /// stage's own `DeadlineExceeded` variant is returned.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: DeadlineError,
    {
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(E::deadline_exceeded()),
        }
    }
}

/// RequestContext Extractor Implementation
///
/// Hands the request's context to a handler. Never rejects.
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
    PipelineState: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let pipeline = PipelineState::from_ref(state);
        Ok(RequestContext::from_parts(parts, pipeline.default_timeout()))
    }
}

/// Pipeline
///
/// The ordered request stages shared by every route:
/// admission, credential verification, identity resolution and authorization.
pub struct Pipeline {
    limiter: Option<FixedWindowLimiter>,
    codec: TokenCodec,
    resolver: IdentityResolver,
    gate: AuthorizationGate,
    request_timeout: Duration,
}

/// PipelineState
pub type PipelineState = Arc<Pipeline>;

impl Pipeline {
    pub fn new(config: &AppConfig, cache: CacheState, repo: RepositoryState) -> Self {
        let limiter = config
            .rate_limit
            .enabled
            .then(|| FixedWindowLimiter::from_config(&config.rate_limit));

        Self {
            limiter,
            codec: TokenCodec::new(&config.auth),
            resolver: IdentityResolver::new(cache, repo.clone(), config.cache.clone()),
            gate: AuthorizationGate::new(repo),
            request_timeout: config.request_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn limiter(&self) -> Option<&FixedWindowLimiter> {
        self.limiter.as_ref()
    }

    /// admit
    ///
    /// Admission control. Always permits when rate limiting is disabled.
    pub fn admit(&self, client_key: &str) -> Result<(), ApiError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        let admission = limiter.allow(client_key);
        if admission.permitted {
            Ok(())
        } else {
            tracing::warn!(
                client = %client_key,
                retry_after_ms = admission.retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            Err(ApiError::RateLimited {
                retry_after: admission.retry_after,
            })
        }
    }

    /// authenticate
    ///
    /// Bearer token -> subject id -> full identity. An identity that no longer
    /// exists is treated as a bad credential rather than a missing resource.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        authorization: Option<&str>,
    ) -> Result<AuthUser, ApiError> {
        let token = bearer_token(authorization)?;
        let user_id = self.codec.verify(token)?;

        match self.resolver.resolve(ctx, user_id).await {
            Ok(user) => Ok(AuthUser(user)),
            Err(ResolveError::NotFound) => {
                tracing::debug!(user_id, "token subject does not resolve to a user");
                Err(ApiError::InvalidCredential)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// authorize
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        user: &AuthUser,
        resource_owner: Option<Id>,
        required_role: &str,
    ) -> Result<(), ApiError> {
        self.gate
            .authorize(ctx, &user.0, resource_owner, required_role)
            .await
            .map_err(ApiError::from)
    }
}

/// request_context_middleware
///
/// Outermost pipeline stage. Installs the `RequestContext` and bounds the rest
/// of the request by its deadline; on expiry the in-flight future is dropped
/// and the caller gets a 504.
pub async fn request_context_middleware(
    State(pipeline): State<PipelineState>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::new(pipeline.default_timeout());
    request.extensions_mut().insert(ctx);

    match tokio::time::timeout_at(ctx.deadline(), next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("request exceeded its deadline");
            ApiError::DeadlineExceeded.into_response()
        }
    }
}

/// rate_limit_middleware
///
/// Admission control, applied before authentication so rejected clients never
/// cost a token verification or cache round-trip.
pub async fn rate_limit_middleware(
    State(pipeline): State<PipelineState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    pipeline.admit(&client_key(&request))?;
    Ok(next.run(request).await)
}
