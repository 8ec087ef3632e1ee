use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::Repository;
use crate::{
    authz::{ROLE_ADMIN, ROLE_MODERATOR, ROLE_USER},
    error::{ConflictKind, StoreError},
    models::{
        Comment, FeedItem, FeedQuery, Id, NewPost, NewUser, Post, PostChanges, Role, SortOrder,
        User, UserCredentials,
    },
};

struct StoredUser {
    id: Id,
    username: String,
    email: String,
    password_hash: String,
    is_active: bool,
    role_id: Id,
    created_at: DateTime<Utc>,
}

struct Invitation {
    token_hash: String,
    user_id: Id,
    expiry: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    roles: Vec<Role>,
    users: BTreeMap<Id, StoredUser>,
    invitations: Vec<Invitation>,
    posts: BTreeMap<Id, Post>,
    comments: Vec<Comment>,
    // (followed, follower)
    followers: HashSet<(Id, Id)>,
    next_id: Id,
}

impl Tables {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn role(&self, id: Id) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id)
    }

    fn user_view(&self, stored: &StoredUser) -> Result<User, StoreError> {
        let role = self
            .role(stored.role_id)
            .cloned()
            .ok_or_else(|| StoreError::Unavailable(format!("dangling role {}", stored.role_id)))?;
        Ok(User {
            id: stored.id,
            username: stored.username.clone(),
            email: stored.email.clone(),
            is_active: stored.is_active,
            role,
            created_at: stored.created_at,
        })
    }

    fn username(&self, id: Id) -> String {
        self.users
            .get(&id)
            .map(|u| u.username.clone())
            .unwrap_or_default()
    }
}

/// InMemoryRepository
///
/// A `Repository` over in-process tables guarded by one async mutex. Used for
/// local runs without a database and throughout the test suite.
///
/// Each operation holds the lock for its whole read-modify-write, which gives
/// the same atomicity the Postgres transactions provide.
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
    user_reads: AtomicUsize,
    fail_deletes: AtomicBool,
    unavailable: AtomicBool,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    /// new
    ///
    /// Seeds the role catalog: user (1), moderator (2), admin (3).
    pub fn new() -> Self {
        let roles = vec![
            Role {
                id: 1,
                name: ROLE_USER.to_string(),
                level: 1,
                description: "A user can create posts and comments".to_string(),
            },
            Role {
                id: 2,
                name: ROLE_MODERATOR.to_string(),
                level: 2,
                description: "A moderator can update other users' posts".to_string(),
            },
            Role {
                id: 3,
                name: ROLE_ADMIN.to_string(),
                level: 3,
                description: "An admin can update and delete other users' posts".to_string(),
            },
        ];

        Self {
            tables: Mutex::new(Tables {
                roles,
                ..Tables::default()
            }),
            user_reads: AtomicUsize::new(0),
            fail_deletes: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }

    // --- Test Controls ---

    /// Number of `get_user_by_id` calls served so far.
    pub fn user_reads(&self) -> usize {
        self.user_reads.load(Ordering::SeqCst)
    }

    /// Makes `delete_user` fail, e.g. to exercise a failed saga compensation.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Makes every operation fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// insert_user
    ///
    /// Seeds a user directly, bypassing registration.
    pub async fn insert_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        role_name: &str,
        is_active: bool,
    ) -> User {
        let mut tables = self.tables.lock().await;
        let role_id = tables
            .roles
            .iter()
            .find(|r| r.name == role_name)
            .map(|r| r.id)
            .unwrap_or(1);
        let id = tables.next_id();
        let stored = StoredUser {
            id,
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            is_active,
            role_id,
            created_at: Utc::now(),
        };
        let user = tables.user_view(&stored).unwrap_or_default();
        tables.users.insert(id, stored);
        user
    }

    /// Moves every pending invitation's expiry into the past.
    pub async fn expire_invitations(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for invitation in self.tables.lock().await.invitations.iter_mut() {
            invitation.expiry = past;
        }
    }

    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }

    pub async fn invitation_count(&self) -> usize {
        self.tables.lock().await.invitations.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "Mock Store Error: Simulation requested".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_and_invite(
        &self,
        new_user: NewUser,
        token_hash: &str,
        expiry: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;

        if tables.users.values().any(|u| u.email == new_user.email) {
            return Err(StoreError::Conflict(ConflictKind::DuplicateEmail));
        }
        if tables.users.values().any(|u| u.username == new_user.username) {
            return Err(StoreError::Conflict(ConflictKind::DuplicateUsername));
        }

        let role_id = tables
            .roles
            .iter()
            .find(|r| r.name == ROLE_USER)
            .map(|r| r.id)
            .ok_or_else(|| StoreError::Unavailable("role catalog is empty".to_string()))?;

        let id = tables.next_id();
        let stored = StoredUser {
            id,
            username: new_user.username,
            email: new_user.email,
            password_hash: new_user.password_hash,
            is_active: false,
            role_id,
            created_at: Utc::now(),
        };
        let user = tables.user_view(&stored)?;
        tables.users.insert(id, stored);
        tables.invitations.push(Invitation {
            token_hash: token_hash.to_string(),
            user_id: id,
            expiry,
        });
        Ok(user)
    }

    async fn activate(&self, token_hash: &str) -> Result<Id, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let now = Utc::now();

        let user_id = tables
            .invitations
            .iter()
            .find(|i| i.token_hash == token_hash && i.expiry > now)
            .map(|i| i.user_id)
            .ok_or(StoreError::NotFound)?;

        let user = tables.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.is_active = true;
        tables.invitations.retain(|i| i.user_id != user_id);
        Ok(user_id)
    }

    async fn get_user_by_id(&self, id: Id) -> Result<User, StoreError> {
        self.check()?;
        self.user_reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;
        let stored = tables.users.get(&id).ok_or(StoreError::NotFound)?;
        tables.user_view(stored)
    }

    async fn get_credentials_by_email(&self, email: &str) -> Result<UserCredentials, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        let stored = tables
            .users
            .values()
            .find(|u| u.email == email && u.is_active)
            .ok_or(StoreError::NotFound)?;
        Ok(UserCredentials {
            user: tables.user_view(stored)?,
            password_hash: stored.password_hash.clone(),
        })
    }

    async fn delete_user(&self, id: Id) -> Result<(), StoreError> {
        self.check()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "Mock Store Error: delete failure requested".to_string(),
            ));
        }
        let mut tables = self.tables.lock().await;
        tables.invitations.retain(|i| i.user_id != id);
        tables.followers.retain(|(a, b)| *a != id && *b != id);
        tables.users.remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn set_user_role(&self, id: Id, role_name: &str) -> Result<User, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let role_id = tables
            .roles
            .iter()
            .find(|r| r.name == role_name)
            .map(|r| r.id)
            .ok_or(StoreError::NotFound)?;
        let stored = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        stored.role_id = role_id;
        let stored = tables.users.get(&id).ok_or(StoreError::NotFound)?;
        tables.user_view(stored)
    }

    async fn get_role_by_name(&self, name: &str) -> Result<Role, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        tables
            .roles
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_post(&self, post: NewPost) -> Result<Post, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&post.user_id) {
            return Err(StoreError::NotFound);
        }
        let id = tables.next_id();
        let now = Utc::now();
        let created = Post {
            id,
            user_id: post.user_id,
            title: post.title,
            content: post.content,
            tags: post.tags,
            version: 0,
            created_at: now,
            updated_at: now,
            comments: Vec::new(),
        };
        tables.posts.insert(id, created.clone());
        Ok(created)
    }

    async fn get_post(&self, id: Id) -> Result<Post, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        tables.posts.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_post_with_version(
        &self,
        id: Id,
        expected_version: i32,
        changes: PostChanges,
    ) -> Result<i32, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let post = tables.posts.get_mut(&id).ok_or(StoreError::NotFound)?;
        if post.version != expected_version {
            return Err(StoreError::StaleVersion);
        }
        post.title = changes.title;
        post.content = changes.content;
        post.version += 1;
        post.updated_at = Utc::now();
        Ok(post.version)
    }

    async fn delete_post(&self, id: Id) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        tables.posts.remove(&id).ok_or(StoreError::NotFound)?;
        tables.comments.retain(|c| c.post_id != id);
        Ok(())
    }

    async fn create_comment(
        &self,
        post_id: Id,
        user_id: Id,
        content: &str,
    ) -> Result<Comment, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        if !tables.posts.contains_key(&post_id) || !tables.users.contains_key(&user_id) {
            return Err(StoreError::NotFound);
        }
        let comment = Comment {
            id: tables.next_id(),
            post_id,
            user_id,
            content: content.to_string(),
            created_at: Utc::now(),
            username: tables.username(user_id),
        };
        tables.comments.push(comment.clone());
        Ok(comment)
    }

    async fn get_comments_by_post(&self, post_id: Id) -> Result<Vec<Comment>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        let mut comments: Vec<Comment> = tables
            .comments
            .iter()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(comments)
    }

    async fn follow(&self, follower_id: Id, followed_id: Id) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&followed_id) || !tables.users.contains_key(&follower_id) {
            return Err(StoreError::NotFound);
        }
        if !tables.followers.insert((followed_id, follower_id)) {
            return Err(StoreError::Conflict(ConflictKind::DuplicateFollow));
        }
        Ok(())
    }

    async fn unfollow(&self, follower_id: Id, followed_id: Id) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        if tables.followers.remove(&(followed_id, follower_id)) {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn get_user_feed(
        &self,
        user_id: Id,
        query: &FeedQuery,
    ) -> Result<Vec<FeedItem>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;

        let tags = query.tag_list();
        let search = query
            .search
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut comment_counts: HashMap<Id, i64> = HashMap::new();
        for comment in &tables.comments {
            *comment_counts.entry(comment.post_id).or_default() += 1;
        }

        let mut items: Vec<FeedItem> = tables
            .posts
            .values()
            .filter(|p| p.user_id == user_id || tables.followers.contains(&(p.user_id, user_id)))
            .filter(|p| tags.iter().all(|t| p.tags.contains(t)))
            .filter(|p| {
                search.as_ref().is_none_or(|s| {
                    p.title.to_lowercase().contains(s) || p.content.to_lowercase().contains(s)
                })
            })
            .map(|p| FeedItem {
                post: p.clone(),
                username: tables.username(p.user_id),
                comments_count: comment_counts.get(&p.id).copied().unwrap_or(0),
            })
            .collect();

        items.sort_by(|a, b| {
            let order = a
                .post
                .created_at
                .cmp(&b.post.created_at)
                .then(a.post.id.cmp(&b.post.id));
            match query.sort {
                SortOrder::Asc => order,
                SortOrder::Desc => order.reverse(),
            }
        });

        Ok(items
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }
}
