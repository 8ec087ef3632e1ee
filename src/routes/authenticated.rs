use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Authenticated Router Module
///
/// Every route here sits behind the auth middleware, so handlers always receive a
/// resolved `AuthUser`. Ownership-sensitive post routes run the authorization gate
/// inside the handler, once the post's owner is known.
pub fn authenticated_routes() -> Router<AppState> {
    Router::<AppState>::new()
        // --- Users ---
        // GET /users/feed
        .route("/users/feed", get(handlers::get_feed))
        .route("/users/{id}", get(handlers::get_user))
        // PUT /users/{id}/follow, PUT /users/{id}/unfollow
        .route("/users/{id}/follow", put(handlers::follow_user))
        .route("/users/{id}/unfollow", put(handlers::unfollow_user))
        // --- Posts ---
        .route("/posts", post(handlers::create_post))
        // PATCH requires owner or moderator, DELETE requires owner or admin.
        .route(
            "/posts/{id}",
            get(handlers::get_post)
                .patch(handlers::update_post)
                .delete(handlers::delete_post),
        )
        .route("/posts/{id}/comments", post(handlers::create_comment))
}
