use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use ts_rs::TS;
use utoipa::{IntoParams, ToSchema};

/// Numeric identifier shared by users, posts and comments.
pub type Id = i64;

// --- Core Schemas (Mapped to Database) ---

/// Role
///
/// An entry in the role catalog. `level` is the precedence used by the
/// authorization gate: higher is more privileged and ties count as sufficient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Role {
    pub id: Id,
    pub name: String,
    pub level: i32,
    pub description: String,
}

/// User
///
/// The identity view handed around the request pipeline and written to the
/// identity cache. The password hash never lives here; see `UserCredentials`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub role: Role,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

/// UserCredentials
///
/// A user together with the stored bcrypt hash. Only produced by the login lookup.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

/// NewUser
///
/// Input to the atomic create-and-invite step of registration.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Post
///
/// `version` is the optimistic-concurrency counter. Comments are only populated
/// on single-post reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct Post {
    pub id: Id,
    pub user_id: Id,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub version: i32,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// Comment
///
/// A comment on a post, carrying the author's username (joined on read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub user_id: Id,
    pub content: String,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    pub username: String,
}

/// FeedItem
///
/// One row of a personalized feed: the post, its author and its comment count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct FeedItem {
    pub post: Post,
    pub username: String,
    pub comments_count: i64,
}

// --- Request Payloads ---

/// RegisterUserRequest
///
/// Input payload for POST /auth/user. The password is hashed before it reaches
/// the store and is never logged.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RegisterUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// CreateTokenRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateTokenRequest {
    pub email: String,
    pub password: String,
}

/// CreatePostRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct CreatePostRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// UpdatePostRequest
///
/// Partial update for PATCH /posts/{id}. `version` is the version the client last
/// read; the update is rejected if the stored post has moved on.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdatePostRequest {
    pub version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// PostChanges
///
/// The fully merged title/content written by a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostChanges {
    pub title: String,
    pub content: String,
}

/// NewPost
#[derive(Debug, Clone)]
pub struct NewPost {
    pub user_id: Id,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
}

/// CreateCommentRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct CreateCommentRequest {
    pub content: String,
}

/// ChangeRoleRequest
///
/// Admin payload for PATCH /users/{id}/role.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ChangeRoleRequest {
    pub role: String,
}

// --- Payload Validation ---

fn require_len(field: &str, value: &str, max: usize) -> Result<(), String> {
    let len = value.trim().chars().count();
    if len == 0 {
        return Err(format!("{} is required", field));
    }
    if len > max {
        return Err(format!("{} must be at most {} characters", field, max));
    }
    Ok(())
}

impl RegisterUserRequest {
    /// validate
    ///
    /// Username up to 100 characters, a plausible email up to 255, and a password
    /// of 3 to 72 bytes (bcrypt ignores anything past 72).
    pub fn validate(&self) -> Result<(), String> {
        require_len("username", &self.username, 100)?;
        require_len("email", &self.email, 255)?;
        if !self.email.contains('@') {
            return Err("email is not valid".to_string());
        }
        if !(3..=72).contains(&self.password.len()) {
            return Err("password must be between 3 and 72 characters".to_string());
        }
        Ok(())
    }
}

impl CreatePostRequest {
    pub fn validate(&self) -> Result<(), String> {
        require_len("title", &self.title, 100)?;
        require_len("content", &self.content, 1000)
    }
}

impl UpdatePostRequest {
    /// validate
    ///
    /// Omitted fields keep their stored value; present fields follow the same
    /// bounds as on creation.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(title) = &self.title {
            require_len("title", title, 100)?;
        }
        if let Some(content) = &self.content {
            require_len("content", content, 1000)?;
        }
        Ok(())
    }

    /// merged_with
    ///
    /// The full title/content to write, falling back to `current` for omitted fields.
    pub fn merged_with(&self, current: &Post) -> PostChanges {
        PostChanges {
            title: self.title.clone().unwrap_or_else(|| current.title.clone()),
            content: self.content.clone().unwrap_or_else(|| current.content.clone()),
        }
    }
}

impl CreateCommentRequest {
    pub fn validate(&self) -> Result<(), String> {
        require_len("content", &self.content, 1000)
    }
}

// --- Responses ---

/// RegistrationResponse
///
/// The created (still inactive) user. `token` is the plaintext invitation token
/// and is only echoed back in the local environment.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RegistrationResponse {
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// TokenResponse
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct TokenResponse {
    pub token: String,
}

/// UpdatePostResponse
///
/// The new version to present on the next optimistic update.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UpdatePostResponse {
    pub id: Id,
    pub version: i32,
}

// --- Feed Pagination ---

/// SortOrder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// FeedQuery
///
/// Query string contract for GET /users/feed. `tags` is a comma separated list.
/// `validate` enforces the bounds before the query reaches the store.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct FeedQuery {
    #[serde(default = "FeedQuery::default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            limit: Self::default_limit(),
            offset: 0,
            sort: SortOrder::Desc,
            tags: None,
            search: None,
        }
    }
}

impl FeedQuery {
    pub const MAX_LIMIT: i64 = 20;
    pub const MAX_TAGS: usize = 5;
    pub const MAX_SEARCH_LEN: usize = 100;

    fn default_limit() -> i64 {
        Self::MAX_LIMIT
    }

    /// tag_list
    ///
    /// Splits the comma separated `tags` parameter, dropping empty segments.
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// validate
    ///
    /// Returns a human-readable reason when the query falls outside its contract.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=Self::MAX_LIMIT).contains(&self.limit) {
            return Err(format!("limit must be between 1 and {}", Self::MAX_LIMIT));
        }
        if self.offset < 0 {
            return Err("offset must not be negative".to_string());
        }
        if self.tag_list().len() > Self::MAX_TAGS {
            return Err(format!("at most {} tags are allowed", Self::MAX_TAGS));
        }
        if self
            .search
            .as_deref()
            .is_some_and(|s| s.chars().count() > Self::MAX_SEARCH_LEN)
        {
            return Err(format!(
                "search must be at most {} characters",
                Self::MAX_SEARCH_LEN
            ));
        }
        Ok(())
    }
}
