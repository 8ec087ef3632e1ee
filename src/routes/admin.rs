use crate::{AppState, handlers};
use axum::{Router, routing::patch};

/// Admin Router Module
///
/// Role administration. The router is mounted behind the auth middleware and each
/// handler checks the `admin` role through the authorization gate with no ownership
/// shortcut.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // PATCH /users/{id}/role
        .route("/users/{id}/role", patch(handlers::change_user_role))
}
