use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::AuthConfig,
    error::{ApiError, CredentialError},
    models::{Id, User},
    pipeline::{PipelineState, RequestContext},
};

/// Subject
///
/// The `sub` claim. Tokens issued by this service carry a JSON number; a numeric
/// string is accepted as well since many issuers stringify `sub`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Id(Id),
    Text(String),
}

/// Claims
///
/// Standard payload structure expected inside a JSON Web Token. These claims are
/// signed with the server's secret and validated on every authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (sub): the numeric id of the user.
    pub sub: Subject,
    /// Expiration Time (exp): the token must not be accepted after this instant.
    pub exp: i64,
    /// Issued At (iat).
    pub iat: i64,
    /// Not Before (nbf).
    pub nbf: i64,
    /// Issuer (iss): checked against the configured issuer.
    pub iss: String,
}

impl Claims {
    /// subject_id
    ///
    /// Parses the subject into a user id, failing with `MalformedClaim` otherwise.
    pub fn subject_id(&self) -> Result<Id, CredentialError> {
        match &self.sub {
            Subject::Id(id) => Ok(*id),
            Subject::Text(raw) => raw
                .trim()
                .parse::<Id>()
                .map_err(|_| CredentialError::MalformedClaim),
        }
    }
}

/// TokenCodec
///
/// Encodes and verifies HS256 bearer tokens. Stateless and pure: it never touches
/// the store, so it can sit in front of every other pipeline stage.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    token_exp: chrono::Duration,
}

impl TokenCodec {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry and issuer are always enforced; nbf guards against clock games.
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[config.issuer.as_str()]);

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            token_exp: chrono::Duration::from_std(config.token_exp)
                .unwrap_or(chrono::Duration::days(3)),
        }
    }

    /// claims_for
    ///
    /// Builds the claim set for a freshly issued token.
    pub fn claims_for(&self, user_id: Id) -> Claims {
        let now = Utc::now();
        Claims {
            sub: Subject::Id(user_id),
            exp: (now + self.token_exp).timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            iss: self.issuer.clone(),
        }
    }

    /// encode
    pub fn encode(&self, claims: &Claims) -> Result<String, CredentialError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            tracing::error!("token encoding failed: {:?}", e);
            CredentialError::InvalidCredential
        })
    }

    /// decode
    ///
    /// Validates the token and returns its claims.
    ///
    /// *Classification*: structural damage is `InvalidCredential`, a token that
    /// parses but fails signature/time/issuer checks is `ExpiredOrUnverifiable`, and
    /// a payload that does not fit `Claims` is `MalformedClaim`.
    pub fn decode(&self, token: &str) -> Result<Claims, CredentialError> {
        // A header that does not parse is structural damage, whatever the cause.
        decode_header(token).map_err(|_| CredentialError::InvalidCredential)?;

        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature
                | ErrorKind::ImmatureSignature
                | ErrorKind::InvalidSignature
                | ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::MissingRequiredClaim(_) => CredentialError::ExpiredOrUnverifiable,
                ErrorKind::Json(_) => CredentialError::MalformedClaim,
                _ => CredentialError::InvalidCredential,
            })
    }

    /// verify
    ///
    /// Decodes the token and extracts the subject id in one step.
    pub fn verify(&self, token: &str) -> Result<Id, CredentialError> {
        self.decode(token)?.subject_id()
    }
}

/// bearer_token
///
/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: Option<&str>) -> Result<&str, CredentialError> {
    let value = header_value.ok_or(CredentialError::InvalidCredential)?;
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) => Ok(token),
        _ => Err(CredentialError::InvalidCredential),
    }
}

/// hash_invitation_token
///
/// One-way digest of an invitation token. Only this digest is persisted.
pub fn hash_invitation_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// hash_password
///
/// bcrypt is CPU bound, so the work runs on the blocking pool.
pub async fn hash_password(password: String, cost: u32) -> Result<String, String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}

/// verify_password
pub async fn verify_password(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

/// AuthUser
///
/// The resolved identity of an authenticated request. It is passed explicitly to
/// every handler and authorization check instead of living in an ambient context.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    pub fn id(&self) -> Id {
        self.0.id
    }
}

/// AuthUser Extractor Implementation
///
/// Runs credential verification and cache-aside identity resolution through the
/// shared `Pipeline`. The result is stored in the request extensions, so the auth
/// middleware and the handler behind it resolve the identity only once.
///
/// Rejection: an `ApiError` (401 for credential failures and unknown subjects).
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    PipelineState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthUser>() {
            return Ok(user.clone());
        }

        let pipeline = PipelineState::from_ref(state);
        let ctx = RequestContext::from_parts(parts, pipeline.default_timeout());

        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let user = pipeline.authenticate(&ctx, header_value).await?;
        parts.extensions.insert(user.clone());
        Ok(user)
    }
}
