use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

// --- Component Error Types ---

/// ConflictKind
///
/// The uniqueness rule a write collided with. Each kind is reported to the caller
/// as its own outcome instead of a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConflictKind {
    DuplicateEmail,
    DuplicateUsername,
    DuplicateFollow,
}

impl ConflictKind {
    pub fn message(&self) -> &'static str {
        match self {
            ConflictKind::DuplicateEmail => "a user with that email already exists",
            ConflictKind::DuplicateUsername => "a user with that username already exists",
            ConflictKind::DuplicateFollow => "you already follow this user",
        }
    }
}

/// CredentialError
///
/// Failures while decoding a bearer token or extracting its subject claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("token expired or could not be verified")]
    ExpiredOrUnverifiable,
    #[error("token subject claim is malformed")]
    MalformedClaim,
}

/// StoreError
///
/// Outcomes of a durable-store call. `Unavailable` carries the driver detail for
/// server-side logging only; it is never rendered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("resource not found")]
    NotFound,
    #[error("resource was modified concurrently")]
    StaleVersion,
    #[error("{}", .0.message())]
    Conflict(ConflictKind),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// CacheError
///
/// A cache backend failure. Deliberately has no "miss" variant: a miss is `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// ResolveError
///
/// Result of identity resolution through the cache-aside path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("identity not found")]
    NotFound,
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// AuthzError
///
/// `Forbidden` is the deny outcome; everything else is a failure to decide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthzError {
    #[error("forbidden")]
    Forbidden,
    #[error("role '{0}' is not in the role catalog")]
    RoleLookupFailed(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// NotificationError
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("notification delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// RegistrationError
///
/// Every way the registration saga can end without an active invitation in flight.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("{}", .0.message())]
    Conflict(ConflictKind),
    #[error(transparent)]
    Delivery(NotificationError),
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RegistrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(kind) => RegistrationError::Conflict(kind),
            other => RegistrationError::Store(other),
        }
    }
}

/// DeadlineError
///
/// Implemented by every error type that can be produced by a stage bounded by a
/// `RequestContext` deadline.
pub trait DeadlineError {
    fn deadline_exceeded() -> Self;
}

impl DeadlineError for StoreError {
    fn deadline_exceeded() -> Self {
        StoreError::DeadlineExceeded
    }
}

impl DeadlineError for CacheError {
    fn deadline_exceeded() -> Self {
        CacheError::DeadlineExceeded
    }
}

impl DeadlineError for ResolveError {
    fn deadline_exceeded() -> Self {
        ResolveError::DeadlineExceeded
    }
}

impl DeadlineError for AuthzError {
    fn deadline_exceeded() -> Self {
        AuthzError::DeadlineExceeded
    }
}

impl DeadlineError for NotificationError {
    fn deadline_exceeded() -> Self {
        NotificationError::DeadlineExceeded
    }
}

impl DeadlineError for RegistrationError {
    fn deadline_exceeded() -> Self {
        RegistrationError::Store(StoreError::DeadlineExceeded)
    }
}

impl DeadlineError for ApiError {
    fn deadline_exceeded() -> Self {
        ApiError::DeadlineExceeded
    }
}

// --- Caller-Facing Error ---

/// ApiError
///
/// The closed set of outcomes the HTTP layer can render. Every component error
/// folds into exactly one variant, and `IntoResponse` matches exhaustively so a new
/// variant cannot ship without a status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("token expired or could not be verified")]
    ExpiredOrUnverifiable,
    #[error("token subject claim is malformed")]
    MalformedClaim,
    #[error("resource not found")]
    NotFound,
    #[error("resource was modified concurrently, re-read and retry")]
    StaleVersion,
    #[error("{}", .0.message())]
    Conflict(ConflictKind),
    #[error("forbidden")]
    Forbidden,
    #[error("role lookup failed: {0}")]
    RoleLookupFailed(String),
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("notification delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::InvalidCredential => ApiError::InvalidCredential,
            CredentialError::ExpiredOrUnverifiable => ApiError::ExpiredOrUnverifiable,
            CredentialError::MalformedClaim => ApiError::MalformedClaim,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::StaleVersion => ApiError::StaleVersion,
            StoreError::Conflict(kind) => ApiError::Conflict(kind),
            StoreError::Unavailable(detail) => ApiError::StoreUnavailable(detail),
            StoreError::DeadlineExceeded => ApiError::DeadlineExceeded,
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Unavailable(detail) => ApiError::CacheUnavailable(detail),
            CacheError::DeadlineExceeded => ApiError::DeadlineExceeded,
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound => ApiError::NotFound,
            ResolveError::CacheUnavailable(detail) => ApiError::CacheUnavailable(detail),
            ResolveError::StoreUnavailable(detail) => ApiError::StoreUnavailable(detail),
            ResolveError::DeadlineExceeded => ApiError::DeadlineExceeded,
        }
    }
}

impl From<AuthzError> for ApiError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::Forbidden => ApiError::Forbidden,
            AuthzError::RoleLookupFailed(role) => ApiError::RoleLookupFailed(role),
            AuthzError::StoreUnavailable(detail) => ApiError::StoreUnavailable(detail),
            AuthzError::DeadlineExceeded => ApiError::DeadlineExceeded,
        }
    }
}

impl From<NotificationError> for ApiError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::DeliveryFailed { .. } => ApiError::DeliveryFailed(err.to_string()),
            NotificationError::DeadlineExceeded => ApiError::DeadlineExceeded,
        }
    }
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::Conflict(kind) => ApiError::Conflict(kind),
            RegistrationError::Delivery(inner) => inner.into(),
            RegistrationError::Hashing(detail) => ApiError::Internal(detail),
            RegistrationError::Store(inner) => inner.into(),
        }
    }
}

/// ErrorBody
///
/// JSON envelope returned for every failure: `{"error": "..."}`.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

impl ApiError {
    /// status_code
    ///
    /// The single HTTP status each outcome maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidCredential
            | ApiError::ExpiredOrUnverifiable
            | ApiError::MalformedClaim => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::StaleVersion | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CacheUnavailable(_) | ApiError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RoleLookupFailed(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// public_message
    ///
    /// What the caller is allowed to see. Infrastructure and internal failures are
    /// reduced to a generic sentence; the detail only goes to the server log.
    fn public_message(&self) -> String {
        match self {
            ApiError::RoleLookupFailed(_) | ApiError::Internal(_) => {
                "the server encountered a problem".to_string()
            }
            ApiError::CacheUnavailable(_) | ApiError::StoreUnavailable(_) => {
                "the service is temporarily unavailable".to_string()
            }
            ApiError::DeliveryFailed(_) => "could not deliver the invitation email".to_string(),
            ApiError::RateLimited { .. } => "rate limit exceeded".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = Json(ErrorBody {
            error: self.public_message(),
        });
        let mut response = (status, body).into_response();

        if let ApiError::RateLimited { retry_after } = self {
            // Whole seconds, rounded up so a client never retries too early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
