use crate::{
    AppState,
    auth::AuthUser,
    authz::{ROLE_ADMIN, ROLE_MODERATOR},
    config::Env,
    error::{ApiError, ApiResult, ErrorBody},
    models::{
        ChangeRoleRequest, Comment, CreateCommentRequest, CreatePostRequest, CreateTokenRequest,
        FeedItem, FeedQuery, Id, NewPost, Post, RegisterUserRequest, RegistrationResponse,
        TokenResponse, UpdatePostRequest, UpdatePostResponse, User,
    },
    pipeline::RequestContext,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Serialize;

/// HealthResponse
#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub env: String,
    pub version: String,
}

// --- Public Handlers ---

/// health
///
/// [Public Route] Liveness probe for load balancers and monitoring.
#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        env: format!("{:?}", state.config.env).to_lowercase(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// register_user
///
/// [Public Route] Runs the registration saga: the user is created inactive and an
/// invitation mail carrying the activation link is sent. If the mail cannot be
/// delivered the user is removed again and the caller gets a 502.
///
/// The plaintext invitation token is only echoed back when running locally.
#[utoipa::path(
    post,
    path = "/v1/auth/user",
    request_body = RegisterUserRequest,
    responses(
        (status = 201, description = "User registered", body = RegistrationResponse),
        (status = 400, description = "Invalid payload", body = ErrorBody),
        (status = 409, description = "Email or username taken", body = ErrorBody),
        (status = 502, description = "Invitation could not be delivered", body = ErrorBody)
    )
)]
pub async fn register_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(payload): Json<RegisterUserRequest>,
) -> ApiResult<(StatusCode, Json<RegistrationResponse>)> {
    payload.validate().map_err(ApiError::BadRequest)?;

    let registration = state.coordinator.register(&ctx, payload).await?;

    let token = (state.config.env == Env::Local).then_some(registration.token);
    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            user: registration.user,
            token,
        }),
    ))
}

/// create_token
///
/// [Public Route] Exchanges email and password of an active user for a bearer token.
#[utoipa::path(
    post,
    path = "/v1/auth/token",
    request_body = CreateTokenRequest,
    responses(
        (status = 201, description = "Token issued", body = TokenResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody)
    )
)]
pub async fn create_token(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(payload): Json<CreateTokenRequest>,
) -> ApiResult<(StatusCode, Json<TokenResponse>)> {
    let token = state
        .coordinator
        .issue_token(&ctx, payload.email.trim(), payload.password)
        .await?;
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

/// activate_user
///
/// [Public Route] Redeems an invitation token. Each token works once, before expiry.
#[utoipa::path(
    put,
    path = "/v1/users/activate/{token}",
    params(("token" = String, Path, description = "Invitation token")),
    responses(
        (status = 204, description = "User activated"),
        (status = 404, description = "Unknown, used or expired token", body = ErrorBody)
    )
)]
pub async fn activate_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(token): Path<String>,
) -> ApiResult<StatusCode> {
    state.coordinator.activate(&ctx, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Authenticated Handlers: Users ---

/// get_user
///
/// [Authenticated Route] Reads a user profile through the identity cache.
#[utoipa::path(
    get,
    path = "/v1/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User", body = User),
        (status = 404, description = "No such user", body = ErrorBody)
    )
)]
pub async fn get_user(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Id>,
) -> ApiResult<Json<User>> {
    let user = state.pipeline.resolver().resolve(&ctx, id).await?;
    Ok(Json(user))
}

/// follow_user
#[utoipa::path(
    put,
    path = "/v1/users/{id}/follow",
    params(("id" = i64, Path, description = "User to follow")),
    responses(
        (status = 204, description = "Now following"),
        (status = 404, description = "No such user", body = ErrorBody),
        (status = 409, description = "Already following", body = ErrorBody)
    )
)]
pub async fn follow_user(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Id>,
) -> ApiResult<StatusCode> {
    state.coordinator.follow(&ctx, auth_user.id(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// unfollow_user
#[utoipa::path(
    put,
    path = "/v1/users/{id}/unfollow",
    params(("id" = i64, Path, description = "User to unfollow")),
    responses(
        (status = 204, description = "No longer following"),
        (status = 404, description = "Not following this user", body = ErrorBody)
    )
)]
pub async fn unfollow_user(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Id>,
) -> ApiResult<StatusCode> {
    state.coordinator.unfollow(&ctx, auth_user.id(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// get_feed
///
/// [Authenticated Route] Posts by the caller and the users they follow, newest
/// first by default. Supports `limit`, `offset`, `sort`, `tags` and `search`.
#[utoipa::path(
    get,
    path = "/v1/users/feed",
    params(FeedQuery),
    responses(
        (status = 200, description = "Feed page", body = [FeedItem]),
        (status = 400, description = "Invalid query", body = ErrorBody)
    )
)]
pub async fn get_feed(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<FeedQuery>,
) -> ApiResult<Json<Vec<FeedItem>>> {
    query.validate().map_err(ApiError::BadRequest)?;

    let feed = ctx
        .narrowed(state.config.query_timeout)
        .run(state.repo.get_user_feed(auth_user.id(), &query))
        .await?;
    Ok(Json(feed))
}

// --- Authenticated Handlers: Posts ---

/// create_post
#[utoipa::path(
    post,
    path = "/v1/posts",
    request_body = CreatePostRequest,
    responses(
        (status = 201, description = "Post created", body = Post),
        (status = 400, description = "Invalid payload", body = ErrorBody)
    )
)]
pub async fn create_post(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(payload): Json<CreatePostRequest>,
) -> ApiResult<(StatusCode, Json<Post>)> {
    payload.validate().map_err(ApiError::BadRequest)?;

    let post = state
        .coordinator
        .create_post(
            &ctx,
            NewPost {
                user_id: auth_user.id(),
                title: payload.title,
                content: payload.content,
                tags: payload.tags,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(post)))
}

/// get_post
///
/// [Authenticated Route] A single post with its comments, newest comment first.
#[utoipa::path(
    get,
    path = "/v1/posts/{id}",
    params(("id" = i64, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post", body = Post),
        (status = 404, description = "No such post", body = ErrorBody)
    )
)]
pub async fn get_post(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Id>,
) -> ApiResult<Json<Post>> {
    let query_ctx = ctx.narrowed(state.config.query_timeout);
    let mut post = query_ctx.run(state.repo.get_post(id)).await?;
    post.comments = query_ctx.run(state.repo.get_comments_by_post(id)).await?;
    Ok(Json(post))
}

/// update_post
///
/// [Authenticated Route] Optimistic partial update.
///
/// *Authorization*: the owner, or anyone with at least the `moderator` role.
/// *Concurrency*: `version` must match the stored version; a mismatch is a 409 and
/// the client must re-read before retrying.
#[utoipa::path(
    patch,
    path = "/v1/posts/{id}",
    params(("id" = i64, Path, description = "Post id")),
    request_body = UpdatePostRequest,
    responses(
        (status = 200, description = "Updated", body = UpdatePostResponse),
        (status = 403, description = "Not owner and role too low", body = ErrorBody),
        (status = 404, description = "No such post", body = ErrorBody),
        (status = 409, description = "Stale version", body = ErrorBody)
    )
)]
pub async fn update_post(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Id>,
    Json(payload): Json<UpdatePostRequest>,
) -> ApiResult<Json<UpdatePostResponse>> {
    payload.validate().map_err(ApiError::BadRequest)?;

    let current = ctx
        .narrowed(state.config.query_timeout)
        .run(state.repo.get_post(id))
        .await?;
    state
        .pipeline
        .authorize(&ctx, &auth_user, Some(current.user_id), ROLE_MODERATOR)
        .await?;

    let version = state
        .coordinator
        .update_post(&ctx, id, payload.version, payload.merged_with(&current))
        .await?;
    Ok(Json(UpdatePostResponse { id, version }))
}

/// delete_post
///
/// [Authenticated Route] *Authorization*: the owner, or an `admin`.
#[utoipa::path(
    delete,
    path = "/v1/posts/{id}",
    params(("id" = i64, Path, description = "Post id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Not owner and not admin", body = ErrorBody),
        (status = 404, description = "No such post", body = ErrorBody)
    )
)]
pub async fn delete_post(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Id>,
) -> ApiResult<StatusCode> {
    let current = ctx
        .narrowed(state.config.query_timeout)
        .run(state.repo.get_post(id))
        .await?;
    state
        .pipeline
        .authorize(&ctx, &auth_user, Some(current.user_id), ROLE_ADMIN)
        .await?;

    state.coordinator.delete_post(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// create_comment
#[utoipa::path(
    post,
    path = "/v1/posts/{id}/comments",
    params(("id" = i64, Path, description = "Post id")),
    request_body = CreateCommentRequest,
    responses(
        (status = 201, description = "Comment added", body = Comment),
        (status = 404, description = "No such post", body = ErrorBody)
    )
)]
pub async fn create_comment(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(post_id): Path<Id>,
    Json(payload): Json<CreateCommentRequest>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    payload.validate().map_err(ApiError::BadRequest)?;

    let comment = state
        .coordinator
        .create_comment(&ctx, post_id, auth_user.id(), payload.content.trim())
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

// --- Admin Handlers ---

/// change_user_role
///
/// [Admin Route] Assigns a catalog role. Requires the `admin` role; there is no
/// ownership shortcut, not even for one's own account.
#[utoipa::path(
    patch,
    path = "/v1/users/{id}/role",
    params(("id" = i64, Path, description = "User id")),
    request_body = ChangeRoleRequest,
    responses(
        (status = 200, description = "Role changed", body = User),
        (status = 400, description = "Unknown role", body = ErrorBody),
        (status = 403, description = "Admin role required", body = ErrorBody),
        (status = 404, description = "No such user", body = ErrorBody)
    )
)]
pub async fn change_user_role(
    auth_user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Id>,
    Json(payload): Json<ChangeRoleRequest>,
) -> ApiResult<Json<User>> {
    state
        .pipeline
        .authorize(&ctx, &auth_user, None, ROLE_ADMIN)
        .await?;

    let user = state
        .coordinator
        .change_role(&ctx, id, payload.role.trim())
        .await?;
    Ok(Json(user))
}
