use axum::{
    extract::FromRequestParts,
    http::{Method, Request, Uri, header, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::json;
use social_api::{
    AppConfig, AppState, InMemoryRepository, MemoryCache, MockMailer,
    auth::{AuthUser, Claims, Subject, TokenCodec, bearer_token, hash_invitation_token},
    authz::ROLE_USER,
    error::{ApiError, CredentialError},
};
use std::sync::Arc;

// --- Helper Functions ---

const TEST_JWT_SECRET: &str = "test-secret-value-1234567890";

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.secret = TEST_JWT_SECRET.to_string();
    config
}

fn codec() -> TokenCodec {
    TokenCodec::new(&test_config().auth)
}

fn claims(sub: Subject, exp_offset: i64) -> Claims {
    let now = Utc::now().timestamp();
    Claims {
        sub,
        exp: now + exp_offset,
        iat: now,
        nbf: now,
        iss: test_config().auth.issuer,
    }
}

fn sign_with(secret: &str, payload: &impl serde::Serialize) -> String {
    encode(
        &Header::default(),
        payload,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn create_app_state(repo: Arc<InMemoryRepository>) -> AppState {
    AppState::new(
        test_config(),
        repo,
        Arc::new(MemoryCache::new()),
        Arc::new(MockMailer::new()),
    )
}

/// Helper to get the mutable Parts struct from a generated Request
fn get_request_parts(method: Method, uri: Uri) -> Parts {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let (parts, _) = request.into_parts();
    parts
}

fn with_bearer(parts: &mut Parts, token: &str) {
    parts.headers.insert(
        header::AUTHORIZATION,
        header::HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
}

// --- Token Codec ---

#[test]
fn test_issued_token_verifies_to_subject() {
    let codec = codec();
    let token = codec.encode(&codec.claims_for(42)).unwrap();

    assert_eq!(codec.verify(&token), Ok(42));
}

#[test]
fn test_string_subject_is_accepted() {
    let token = sign_with(TEST_JWT_SECRET, &claims(Subject::Text("17".to_string()), 3600));

    assert_eq!(codec().verify(&token), Ok(17));
}

#[test]
fn test_non_numeric_subject_is_malformed_claim() {
    let token = sign_with(
        TEST_JWT_SECRET,
        &claims(Subject::Text("not-a-number".to_string()), 3600),
    );

    assert_eq!(codec().verify(&token), Err(CredentialError::MalformedClaim));
}

#[test]
fn test_payload_of_wrong_shape_is_malformed_claim() {
    let now = Utc::now().timestamp();
    let token = sign_with(
        TEST_JWT_SECRET,
        &json!({ "sub": { "id": 1 }, "exp": now + 3600, "iat": now, "nbf": now, "iss": "social-api" }),
    );

    assert_eq!(codec().verify(&token), Err(CredentialError::MalformedClaim));
}

#[test]
fn test_expired_token_is_rejected() {
    // Well past the default 60s leeway.
    let token = sign_with(TEST_JWT_SECRET, &claims(Subject::Id(1), -3600));

    assert_eq!(
        codec().verify(&token),
        Err(CredentialError::ExpiredOrUnverifiable)
    );
}

#[test]
fn test_foreign_signature_is_rejected() {
    let token = sign_with("some-other-secret", &claims(Subject::Id(1), 3600));

    assert_eq!(
        codec().verify(&token),
        Err(CredentialError::ExpiredOrUnverifiable)
    );
}

#[test]
fn test_foreign_issuer_is_rejected() {
    let mut foreign = claims(Subject::Id(1), 3600);
    foreign.iss = "someone-else".to_string();
    let token = sign_with(TEST_JWT_SECRET, &foreign);

    assert_eq!(
        codec().verify(&token),
        Err(CredentialError::ExpiredOrUnverifiable)
    );
}

#[test]
fn test_garbage_token_is_invalid_credential() {
    assert_eq!(
        codec().verify("definitely.not-a.jwt"),
        Err(CredentialError::InvalidCredential)
    );
    assert_eq!(codec().verify(""), Err(CredentialError::InvalidCredential));
}

#[test]
fn test_bearer_token_parsing() {
    assert_eq!(bearer_token(Some("Bearer abc")), Ok("abc"));
    assert_eq!(bearer_token(None), Err(CredentialError::InvalidCredential));
    assert_eq!(
        bearer_token(Some("Basic abc")),
        Err(CredentialError::InvalidCredential)
    );
    assert_eq!(
        bearer_token(Some("Bearer")),
        Err(CredentialError::InvalidCredential)
    );
    assert_eq!(
        bearer_token(Some("Bearer a b")),
        Err(CredentialError::InvalidCredential)
    );
}

#[test]
fn test_invitation_token_hash_is_stable_hex() {
    let first = hash_invitation_token("token");
    assert_eq!(first, hash_invitation_token("token"));
    assert_ne!(first, hash_invitation_token("token2"));
    assert_eq!(first.len(), 64);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
}

// --- AuthUser Extractor ---

#[tokio::test]
async fn test_auth_success_with_valid_jwt() {
    let repo = Arc::new(InMemoryRepository::new());
    let seeded = repo
        .insert_user("alice", "alice@example.com", "hash", ROLE_USER, true)
        .await;
    let app_state = create_app_state(repo.clone());

    let token = codec().encode(&codec().claims_for(seeded.id)).unwrap();
    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &token);

    let auth_user = AuthUser::from_request_parts(&mut parts, &app_state)
        .await
        .unwrap();

    assert_eq!(auth_user.id(), seeded.id);
    assert_eq!(auth_user.0.role.name, ROLE_USER);
    // The resolved identity is stashed for the handler.
    assert!(parts.extensions.get::<AuthUser>().is_some());
}

#[tokio::test]
async fn test_auth_resolves_identity_once_per_request() {
    let repo = Arc::new(InMemoryRepository::new());
    let seeded = repo
        .insert_user("alice", "alice@example.com", "hash", ROLE_USER, true)
        .await;
    let app_state = create_app_state(repo.clone());

    let token = codec().encode(&codec().claims_for(seeded.id)).unwrap();
    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &token);

    AuthUser::from_request_parts(&mut parts, &app_state)
        .await
        .unwrap();
    AuthUser::from_request_parts(&mut parts, &app_state)
        .await
        .unwrap();

    assert_eq!(repo.user_reads(), 1);
}

#[tokio::test]
async fn test_auth_failure_with_missing_header() {
    let app_state = create_app_state(Arc::new(InMemoryRepository::new()));
    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());

    let auth_user = AuthUser::from_request_parts(&mut parts, &app_state).await;

    assert_eq!(auth_user.unwrap_err(), ApiError::InvalidCredential);
}

#[tokio::test]
async fn test_auth_failure_with_expired_jwt() {
    let repo = Arc::new(InMemoryRepository::new());
    let seeded = repo
        .insert_user("alice", "alice@example.com", "hash", ROLE_USER, true)
        .await;
    let app_state = create_app_state(repo);

    let token = sign_with(TEST_JWT_SECRET, &claims(Subject::Id(seeded.id), -3600));
    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &token);

    let auth_user = AuthUser::from_request_parts(&mut parts, &app_state).await;

    assert_eq!(auth_user.unwrap_err(), ApiError::ExpiredOrUnverifiable);
}

#[tokio::test]
async fn test_auth_failure_for_unknown_subject() {
    let app_state = create_app_state(Arc::new(InMemoryRepository::new()));

    let token = codec().encode(&codec().claims_for(999)).unwrap();
    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &token);

    let auth_user = AuthUser::from_request_parts(&mut parts, &app_state).await;

    assert_eq!(auth_user.unwrap_err(), ApiError::InvalidCredential);
}

#[tokio::test]
async fn test_local_bypass_header_is_not_honoured() {
    let repo = Arc::new(InMemoryRepository::new());
    let seeded = repo
        .insert_user("root", "root@example.com", "hash", "admin", true)
        .await;
    let app_state = create_app_state(repo);

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    parts.headers.insert(
        header::HeaderName::from_static("x-user-id"),
        header::HeaderValue::from_str(&seeded.id.to_string()).unwrap(),
    );

    let auth_user = AuthUser::from_request_parts(&mut parts, &app_state).await;

    assert_eq!(auth_user.unwrap_err(), ApiError::InvalidCredential);
}
