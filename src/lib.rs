use axum::{
    Router,
    extract::{FromRef, Request},
    http::HeaderName,
    middleware::{self, Next},
    response::Response,
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Request pipeline stages, in execution order.
pub mod pipeline;
pub mod ratelimit;
pub mod auth;
pub mod identity;
pub mod authz;

// Writes and the adapters behind them.
pub mod coordinator;
pub mod repository;
pub mod cache;
pub mod mailer;

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;

// Module for routing segregation (Public, Authenticated, Admin).
pub mod routes;
use auth::AuthUser;
use routes::{admin, authenticated, public};

// --- Public Re-exports ---

pub use cache::{CacheState, MemoryCache, RedisCache};
pub use config::AppConfig;
pub use coordinator::MutationCoordinator;
pub use mailer::{MailerState, MockMailer, SendGridMailer};
pub use pipeline::{Pipeline, PipelineState};
pub use repository::{InMemoryRepository, PostgresRepository, RepositoryState};

/// ApiDoc
///
/// Aggregates every `#[utoipa::path]` handler and `ToSchema` model into the OpenAPI
/// document served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health, handlers::register_user, handlers::create_token,
        handlers::activate_user, handlers::get_user, handlers::follow_user,
        handlers::unfollow_user, handlers::get_feed, handlers::create_post,
        handlers::get_post, handlers::update_post, handlers::delete_post,
        handlers::create_comment, handlers::change_user_role
    ),
    components(
        schemas(
            models::User, models::Role, models::Post, models::Comment, models::FeedItem,
            models::RegisterUserRequest, models::RegistrationResponse,
            models::CreateTokenRequest, models::TokenResponse, models::CreatePostRequest,
            models::UpdatePostRequest, models::UpdatePostResponse,
            models::CreateCommentRequest, models::ChangeRoleRequest, models::SortOrder,
            handlers::HealthResponse, error::ErrorBody,
        )
    ),
    tags(
        (name = "social-api", description = "Social network backend API")
    )
)]
struct ApiDoc;

/// AppState
///
/// The single shared container handed to every handler. Everything inside is
/// behind an `Arc`, so cloning per request is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Durable store, used directly for reads.
    pub repo: RepositoryState,
    /// Admission, authentication and authorization stages.
    pub pipeline: PipelineState,
    /// All state-changing operations.
    pub coordinator: Arc<MutationCoordinator>,
    pub config: AppConfig,
}

impl AppState {
    /// new
    ///
    /// Wires the pipeline and coordinator over the given adapters.
    pub fn new(
        config: AppConfig,
        repo: RepositoryState,
        cache: CacheState,
        mailer: MailerState,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(&config, cache, repo.clone()));
        let coordinator = Arc::new(MutationCoordinator::new(
            &config,
            repo.clone(),
            mailer,
            pipeline.resolver().clone(),
        ));

        Self {
            repo,
            pipeline,
            coordinator,
            config,
        }
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

impl FromRef<AppState> for PipelineState {
    fn from_ref(app_state: &AppState) -> PipelineState {
        app_state.pipeline.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// auth_middleware
///
/// Enforces authentication for the authenticated and admin routers.
///
/// *Mechanism*: extracting `AuthUser` runs credential verification and identity
/// resolution. Any failure rejects the request before the handler runs; on success
/// the identity is already cached in the request extensions for the handler.
async fn auth_middleware(_auth_user: AuthUser, request: Request, next: Next) -> Response {
    next.run(request).await
}

/// create_router
///
/// Assembles the `/v1` API and the documentation UI.
///
/// Stage order for every API request: request context (deadline) -> admission
/// control -> authentication (protected routers only) -> handler.
pub fn create_router(state: AppState) -> Router {
    // 1. CORS Configuration
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    // Header name constant for Request Correlation.
    let x_request_id = HeaderName::from_static("x-request-id");

    // 2. API Router Assembly
    let api = Router::new()
        .merge(public::public_routes())
        .merge(
            authenticated::authenticated_routes().route_layer(middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            )),
        )
        .merge(
            admin::admin_routes().route_layer(middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            )),
        )
        // Layers run outermost-last: the context wraps admission, which wraps auth.
        .layer(middleware::from_fn_with_state(
            state.pipeline.clone(),
            pipeline::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.pipeline.clone(),
            pipeline::request_context_middleware,
        ));

    let base_router = Router::new()
        // Documentation: Serve the auto-generated Swagger UI.
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/v1", api)
        .with_state(state);

    // 3. Observability and Correlation Layers (Applied outermost/first)
    base_router
        .layer(
            ServiceBuilder::new()
                // 3a. Request ID Generation: a UUID for every incoming request.
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                // 3b. Request Tracing: one span per request, carrying the request ID.
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                // 3c. Request ID Propagation: echo x-request-id back to the client.
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        // 4. CORS Layer
        .layer(cors)
}

/// trace_span_logger
///
/// Builds the `TraceLayer` span with the HTTP method, URI and `x-request-id`, so
/// every log line of one request can be correlated.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
