use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    error::StoreError,
    models::{
        Comment, FeedItem, FeedQuery, Id, NewPost, NewUser, Post, PostChanges, Role, User,
        UserCredentials,
    },
};

mod memory;
mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::{PostgresRepository, escape_like};

/// Repository Trait
///
/// The contract for every durable-store operation. Handlers and pipeline stages only
/// ever see `Arc<dyn Repository>`, so Postgres and the in-memory store are
/// interchangeable.
///
/// Every method reports failures as a `StoreError`. Business outcomes (`NotFound`,
/// `StaleVersion`, `Conflict`) are kept apart from `Unavailable`, which always means
/// the store itself could not answer.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Identities & Invitations ---
    /// Creates an inactive user with the `user` role and its invitation in one
    /// atomic step. Duplicate email/username map to their `ConflictKind`.
    async fn create_and_invite(
        &self,
        new_user: NewUser,
        token_hash: &str,
        expiry: DateTime<Utc>,
    ) -> Result<User, StoreError>;
    /// Redeems an unexpired invitation: activates the user and drops its
    /// invitations atomically. Unknown or expired tokens are `NotFound`.
    async fn activate(&self, token_hash: &str) -> Result<Id, StoreError>;
    async fn get_user_by_id(&self, id: Id) -> Result<User, StoreError>;
    // Active users only.
    async fn get_credentials_by_email(&self, email: &str) -> Result<UserCredentials, StoreError>;
    /// Removes the user together with its invitations.
    async fn delete_user(&self, id: Id) -> Result<(), StoreError>;
    async fn set_user_role(&self, id: Id, role_name: &str) -> Result<User, StoreError>;

    // --- Role Catalog ---
    async fn get_role_by_name(&self, name: &str) -> Result<Role, StoreError>;

    // --- Posts ---
    async fn create_post(&self, post: NewPost) -> Result<Post, StoreError>;
    async fn get_post(&self, id: Id) -> Result<Post, StoreError>;
    /// Conditional update. Applies `changes` and bumps the version only when the
    /// stored version equals `expected_version`; returns the new version.
    async fn update_post_with_version(
        &self,
        id: Id,
        expected_version: i32,
        changes: PostChanges,
    ) -> Result<i32, StoreError>;
    async fn delete_post(&self, id: Id) -> Result<(), StoreError>;

    // --- Comments ---
    async fn create_comment(
        &self,
        post_id: Id,
        user_id: Id,
        content: &str,
    ) -> Result<Comment, StoreError>;
    async fn get_comments_by_post(&self, post_id: Id) -> Result<Vec<Comment>, StoreError>;

    // --- Follower Graph ---
    async fn follow(&self, follower_id: Id, followed_id: Id) -> Result<(), StoreError>;
    async fn unfollow(&self, follower_id: Id, followed_id: Id) -> Result<(), StoreError>;

    // --- Feed ---
    /// Posts by the user and everyone they follow, filtered and paged by `query`.
    async fn get_user_feed(&self, user_id: Id, query: &FeedQuery)
    -> Result<Vec<FeedItem>, StoreError>;
}

/// RepositoryState
///
/// The concrete type used to share the persistence layer across the application state.
pub type RepositoryState = Arc<dyn Repository>;
