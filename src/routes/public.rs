use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Public Router Module
///
/// Endpoints that run admission control but no authentication: the health probe
/// and the identity lifecycle (registration, activation, login).
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        .route("/health", get(handlers::health))
        // POST /auth/user
        // Starts the registration saga. The user stays inactive until activation.
        .route("/auth/user", post(handlers::register_user))
        // POST /auth/token
        // Password login for active users; returns a signed bearer token.
        .route("/auth/token", post(handlers::create_token))
        // PUT /users/activate/{token}
        // Redeems the invitation token from the welcome mail.
        .route("/users/activate/{token}", put(handlers::activate_user))
}
