use axum::{
    Json,
    body::to_bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use social_api::{
    AppConfig, AppState, InMemoryRepository, MemoryCache, MockMailer,
    auth::AuthUser,
    authz::{ROLE_ADMIN, ROLE_USER},
    config::Env,
    error::{ApiError, ConflictKind},
    handlers,
    models::{
        ChangeRoleRequest, CreatePostRequest, FeedQuery, RegisterUserRequest, UpdatePostRequest,
    },
    pipeline::RequestContext,
};
use std::{sync::Arc, time::Duration};

// --- Test Fixtures ---

fn app_state_with(config: AppConfig, repo: Arc<InMemoryRepository>) -> AppState {
    AppState::new(
        config,
        repo,
        Arc::new(MemoryCache::new()),
        Arc::new(MockMailer::new()),
    )
}

fn ctx() -> RequestContext {
    RequestContext::new(Duration::from_secs(60))
}

async fn seeded(role: &str) -> (AppState, Arc<InMemoryRepository>, AuthUser) {
    let repo = Arc::new(InMemoryRepository::new());
    let user = repo
        .insert_user("alice", "alice@example.com", "hash", role, true)
        .await;
    let state = app_state_with(AppConfig::default(), repo.clone());
    (state, repo, AuthUser(user))
}

fn post_payload() -> CreatePostRequest {
    CreatePostRequest {
        title: "title".to_string(),
        content: "content".to_string(),
        tags: vec!["rust".to_string()],
    }
}

// --- Public Handlers ---

#[tokio::test]
async fn test_health_reports_environment() {
    let state = app_state_with(AppConfig::default(), Arc::new(InMemoryRepository::new()));

    let Json(health) = handlers::health(State(state)).await;

    assert_eq!(health.status, "ok");
    assert_eq!(health.env, "local");
}

#[tokio::test]
async fn test_register_hides_token_outside_local() {
    let mut config = AppConfig::default();
    config.env = Env::Production;
    let state = app_state_with(config, Arc::new(InMemoryRepository::new()));

    let (status, Json(body)) = handlers::register_user(
        State(state),
        ctx(),
        Json(RegisterUserRequest {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password: "correct horse".to_string(),
        }),
    )
    .await
    .unwrap();

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body.token, None);
}

// --- Post Handlers ---

#[tokio::test]
async fn test_create_post_is_owned_by_caller() {
    let (state, _, caller) = seeded(ROLE_USER).await;

    let (status, Json(post)) =
        handlers::create_post(caller.clone(), State(state), ctx(), Json(post_payload()))
            .await
            .unwrap();

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(post.user_id, caller.id());
    assert_eq!(post.version, 0);
}

#[tokio::test]
async fn test_create_post_rejects_invalid_payload() {
    let (state, _, caller) = seeded(ROLE_USER).await;
    let payload = CreatePostRequest {
        title: String::new(),
        ..post_payload()
    };

    let result = handlers::create_post(caller, State(state), ctx(), Json(payload)).await;

    assert!(matches!(result, Err(ApiError::BadRequest(_))));
}

#[tokio::test]
async fn test_update_post_returns_next_version() {
    let (state, _, caller) = seeded(ROLE_USER).await;
    let (_, Json(post)) =
        handlers::create_post(caller.clone(), State(state.clone()), ctx(), Json(post_payload()))
            .await
            .unwrap();

    let Json(updated) = handlers::update_post(
        caller,
        State(state),
        ctx(),
        Path(post.id),
        Json(UpdatePostRequest {
            version: 0,
            title: None,
            content: Some("edited".to_string()),
        }),
    )
    .await
    .unwrap();

    assert_eq!(updated.id, post.id);
    assert_eq!(updated.version, 1);
}

#[tokio::test]
async fn test_delete_post_by_stranger_is_forbidden() {
    let (state, repo, owner) = seeded(ROLE_USER).await;
    let stranger = repo
        .insert_user("bob", "bob@example.com", "hash", ROLE_USER, true)
        .await;
    let (_, Json(post)) =
        handlers::create_post(owner, State(state.clone()), ctx(), Json(post_payload()))
            .await
            .unwrap();

    let result =
        handlers::delete_post(AuthUser(stranger), State(state), ctx(), Path(post.id)).await;

    assert_eq!(result.unwrap_err(), ApiError::Forbidden);
}

#[tokio::test]
async fn test_feed_rejects_out_of_range_limit() {
    let (state, _, caller) = seeded(ROLE_USER).await;
    let query = FeedQuery {
        limit: 0,
        ..FeedQuery::default()
    };

    let result = handlers::get_feed(caller, State(state), ctx(), Query(query)).await;

    assert!(matches!(result, Err(ApiError::BadRequest(_))));
}

#[tokio::test]
async fn test_store_outage_is_service_unavailable() {
    let (state, repo, caller) = seeded(ROLE_USER).await;
    repo.set_unavailable(true);

    let result =
        handlers::get_feed(caller, State(state), ctx(), Query(FeedQuery::default())).await;

    let err = result.unwrap_err();
    assert!(matches!(err, ApiError::StoreUnavailable(_)));
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}

// --- Admin Handlers ---

#[tokio::test]
async fn test_change_role_requires_admin_even_for_self() {
    let (state, _, caller) = seeded(ROLE_USER).await;
    let own_id = caller.id();

    let result = handlers::change_user_role(
        caller,
        State(state),
        ctx(),
        Path(own_id),
        Json(ChangeRoleRequest {
            role: ROLE_ADMIN.to_string(),
        }),
    )
    .await;

    assert_eq!(result.unwrap_err(), ApiError::Forbidden);
}

// --- Error Rendering ---

#[tokio::test]
async fn test_error_statuses() {
    let cases = [
        (ApiError::InvalidCredential, StatusCode::UNAUTHORIZED),
        (ApiError::MalformedClaim, StatusCode::UNAUTHORIZED),
        (ApiError::NotFound, StatusCode::NOT_FOUND),
        (ApiError::StaleVersion, StatusCode::CONFLICT),
        (
            ApiError::Conflict(ConflictKind::DuplicateFollow),
            StatusCode::CONFLICT,
        ),
        (ApiError::Forbidden, StatusCode::FORBIDDEN),
        (
            ApiError::CacheUnavailable("down".to_string()),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (
            ApiError::DeliveryFailed("smtp".to_string()),
            StatusCode::BAD_GATEWAY,
        ),
        (ApiError::DeadlineExceeded, StatusCode::GATEWAY_TIMEOUT),
        (
            ApiError::RoleLookupFailed("ghost".to_string()),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];

    for (err, status) in cases {
        assert_eq!(err.into_response().status(), status);
    }
}

#[tokio::test]
async fn test_infrastructure_detail_is_not_rendered() {
    let response =
        ApiError::StoreUnavailable("password authentication failed for user app".to_string())
            .into_response();

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(!text.contains("password"));
    assert!(text.contains("temporarily unavailable"));
}

#[tokio::test]
async fn test_rate_limited_sets_retry_after_rounded_up() {
    let response = ApiError::RateLimited {
        retry_after: Duration::from_millis(1500),
    }
    .into_response();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "2");
}
