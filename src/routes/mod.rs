/// Router Module Index
///
/// Routes are split by access level. The access control for each group is applied
/// as a layer in `create_router`, so a handler can never be mounted without it.

/// Routes reachable without a bearer token.
pub mod public;

/// Routes behind the authentication stage of the pipeline.
pub mod authenticated;

/// Routes that additionally require the `admin` role.
pub mod admin;
