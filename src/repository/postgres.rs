use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, query_builder::QueryBuilder};

use super::Repository;
use crate::{
    authz::ROLE_USER,
    error::{ConflictKind, StoreError},
    models::{
        Comment, FeedItem, FeedQuery, Id, NewPost, NewUser, Post, PostChanges, Role, SortOrder,
        User, UserCredentials,
    },
};

// --- Row Shapes ---

#[derive(FromRow)]
struct UserRow {
    id: Id,
    username: String,
    email: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    role_id: Id,
    role_name: String,
    role_level: i32,
    role_description: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            email: row.email,
            is_active: row.is_active,
            created_at: row.created_at,
            role: Role {
                id: row.role_id,
                name: row.role_name,
                level: row.role_level,
                description: row.role_description,
            },
        }
    }
}

#[derive(FromRow)]
struct CredentialsRow {
    #[sqlx(flatten)]
    user: UserRow,
    password: String,
}

#[derive(FromRow)]
struct PostRow {
    id: Id,
    user_id: Id,
    title: String,
    content: String,
    tags: Vec<String>,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            content: row.content,
            tags: row.tags,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            comments: Vec::new(),
        }
    }
}

#[derive(FromRow)]
struct FeedRow {
    #[sqlx(flatten)]
    post: PostRow,
    username: String,
    comments_count: i64,
}

const USER_SELECT: &str = r#"
    SELECT u.id, u.username, u.email, u.is_active, u.created_at,
           r.id AS role_id, r.name AS role_name, r.level AS role_level,
           r.description AS role_description
    FROM users u
    JOIN roles r ON r.id = u.role_id
"#;

const CREDENTIALS_SELECT: &str = r#"
    SELECT u.id, u.username, u.email, u.is_active, u.created_at, u.password,
           r.id AS role_id, r.name AS role_name, r.level AS role_level,
           r.description AS role_description
    FROM users u
    JOIN roles r ON r.id = u.role_id
"#;

const POST_COLUMNS: &str = "id, user_id, title, content, tags, version, created_at, updated_at";

/// escape_like
///
/// Escapes `LIKE` wildcards so a search term matches literally. Pair with
/// `ESCAPE '\'`.
pub fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// store_error
///
/// Translates a driver error into the store's outcome set. Uniqueness and
/// foreign-key violations are business outcomes; everything else is logged and
/// reported as `Unavailable`.
fn store_error(operation: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::RowNotFound = err {
        return StoreError::NotFound;
    }
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            match db.constraint() {
                Some("users_email_key") => {
                    return StoreError::Conflict(ConflictKind::DuplicateEmail);
                }
                Some("users_username_key") => {
                    return StoreError::Conflict(ConflictKind::DuplicateUsername);
                }
                Some("followers_pkey") => {
                    return StoreError::Conflict(ConflictKind::DuplicateFollow);
                }
                _ => {}
            }
        }
        if db.is_foreign_key_violation() {
            return StoreError::NotFound;
        }
    }
    tracing::error!("{} error: {:?}", operation, err);
    StoreError::Unavailable(err.to_string())
}

/// PostgresRepository
///
/// The `Repository` backed by PostgreSQL through a shared `PgPool`.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Creates a new repository instance using the initialized connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    /// create_and_invite
    ///
    /// User row and invitation row are written in one transaction; a constraint
    /// violation on either rolls both back.
    async fn create_and_invite(
        &self,
        new_user: NewUser,
        token_hash: &str,
        expiry: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("create_and_invite begin", e))?;

        let user_id: Id = sqlx::query_scalar(
            r#"
            INSERT INTO users (username, email, password, role_id)
            VALUES ($1, $2, $3, (SELECT id FROM roles WHERE name = $4))
            RETURNING id
            "#,
        )
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(ROLE_USER)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| store_error("create_user", e))?;

        sqlx::query("INSERT INTO user_invitations (token, user_id, expiry) VALUES ($1, $2, $3)")
            .bind(token_hash)
            .bind(user_id)
            .bind(expiry)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("create_invitation", e))?;

        let user = sqlx::query_as::<_, UserRow>(&format!("{USER_SELECT} WHERE u.id = $1"))
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| store_error("create_and_invite read-back", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("create_and_invite commit", e))?;

        Ok(user.into())
    }

    /// activate
    ///
    /// Lookup, activation and invitation cleanup share one transaction, so a
    /// token can only ever be redeemed once.
    async fn activate(&self, token_hash: &str) -> Result<Id, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("activate begin", e))?;

        let user_id: Option<Id> = sqlx::query_scalar(
            r#"
            SELECT u.id
            FROM users u
            JOIN user_invitations ui ON u.id = ui.user_id
            WHERE ui.token = $1 AND ui.expiry > $2
            FOR UPDATE OF ui
            "#,
        )
        .bind(token_hash)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("activate lookup", e))?;

        let user_id = user_id.ok_or(StoreError::NotFound)?;

        sqlx::query("UPDATE users SET is_active = true WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("activate user", e))?;

        sqlx::query("DELETE FROM user_invitations WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("activate cleanup", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("activate commit", e))?;

        Ok(user_id)
    }

    async fn get_user_by_id(&self, id: Id) -> Result<User, StoreError> {
        sqlx::query_as::<_, UserRow>(&format!("{USER_SELECT} WHERE u.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("get_user_by_id", e))?
            .map(User::from)
            .ok_or(StoreError::NotFound)
    }

    async fn get_credentials_by_email(&self, email: &str) -> Result<UserCredentials, StoreError> {
        let row = sqlx::query_as::<_, CredentialsRow>(&format!(
            "{CREDENTIALS_SELECT} WHERE u.email = $1 AND u.is_active = true"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("get_credentials_by_email", e))?
        .ok_or(StoreError::NotFound)?;

        Ok(UserCredentials {
            user: row.user.into(),
            password_hash: row.password,
        })
    }

    async fn delete_user(&self, id: Id) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("delete_user begin", e))?;

        sqlx::query("DELETE FROM user_invitations WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("delete_user invitations", e))?;

        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("delete_user", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("delete_user commit", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_user_role(&self, id: Id, role_name: &str) -> Result<User, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users SET role_id = r.id
            FROM roles r
            WHERE users.id = $1 AND r.name = $2
            "#,
        )
        .bind(id)
        .bind(role_name)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("set_user_role", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_user_by_id(id).await
    }

    async fn get_role_by_name(&self, name: &str) -> Result<Role, StoreError> {
        sqlx::query_as::<_, Role>("SELECT id, name, level, description FROM roles WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("get_role_by_name", e))?
            .ok_or(StoreError::NotFound)
    }

    async fn create_post(&self, post: NewPost) -> Result<Post, StoreError> {
        sqlx::query_as::<_, PostRow>(&format!(
            "INSERT INTO posts (user_id, title, content, tags) VALUES ($1, $2, $3, $4) RETURNING {POST_COLUMNS}"
        ))
        .bind(post.user_id)
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.tags)
        .fetch_one(&self.pool)
        .await
        .map(Post::from)
        .map_err(|e| store_error("create_post", e))
    }

    async fn get_post(&self, id: Id) -> Result<Post, StoreError> {
        sqlx::query_as::<_, PostRow>(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("get_post", e))?
            .map(Post::from)
            .ok_or(StoreError::NotFound)
    }

    /// update_post_with_version
    ///
    /// The version predicate and increment happen in a single statement. When no
    /// row matches, an existence probe tells a vanished post from a stale read.
    async fn update_post_with_version(
        &self,
        id: Id,
        expected_version: i32,
        changes: PostChanges,
    ) -> Result<i32, StoreError> {
        let updated: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE posts
            SET title = $1, content = $2, version = version + 1, updated_at = NOW()
            WHERE id = $3 AND version = $4
            RETURNING version
            "#,
        )
        .bind(&changes.title)
        .bind(&changes.content)
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("update_post_with_version", e))?;

        if let Some(version) = updated {
            return Ok(version);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_error("update_post_with_version probe", e))?;

        if exists {
            Err(StoreError::StaleVersion)
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn delete_post(&self, id: Id) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("delete_post", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_comment(
        &self,
        post_id: Id,
        user_id: Id,
        content: &str,
    ) -> Result<Comment, StoreError> {
        // The insert and the author join are one statement; a missing post trips
        // the foreign key and surfaces as NotFound.
        sqlx::query_as::<_, Comment>(
            r#"
            WITH inserted AS (
                INSERT INTO comments (post_id, user_id, content)
                VALUES ($1, $2, $3)
                RETURNING id, post_id, user_id, content, created_at
            )
            SELECT i.id, i.post_id, i.user_id, i.content, i.created_at, u.username
            FROM inserted i
            JOIN users u ON u.id = i.user_id
            "#,
        )
        .bind(post_id)
        .bind(user_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("create_comment", e))
    }

    async fn get_comments_by_post(&self, post_id: Id) -> Result<Vec<Comment>, StoreError> {
        sqlx::query_as::<_, Comment>(
            r#"
            SELECT c.id, c.post_id, c.user_id, c.content, c.created_at, u.username
            FROM comments c
            JOIN users u ON u.id = c.user_id
            WHERE c.post_id = $1
            ORDER BY c.created_at DESC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("get_comments_by_post", e))
    }

    async fn follow(&self, follower_id: Id, followed_id: Id) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO followers (user_id, follower_id) VALUES ($1, $2)")
            .bind(followed_id)
            .bind(follower_id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("follow", e))?;
        Ok(())
    }

    async fn unfollow(&self, follower_id: Id, followed_id: Id) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM followers WHERE user_id = $1 AND follower_id = $2")
            .bind(followed_id)
            .bind(follower_id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("unfollow", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// get_user_feed
    ///
    /// Built with `QueryBuilder` so every user-supplied filter is a bound
    /// parameter. The sort direction comes from a closed enum.
    async fn get_user_feed(
        &self,
        user_id: Id,
        query: &FeedQuery,
    ) -> Result<Vec<FeedItem>, StoreError> {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            r#"
            SELECT p.id, p.user_id, p.title, p.content, p.tags, p.version,
                   p.created_at, p.updated_at, u.username,
                   COUNT(c.id) AS comments_count
            FROM posts p
            JOIN users u ON u.id = p.user_id
            LEFT JOIN comments c ON c.post_id = p.id
            WHERE (p.user_id = "#,
        );
        builder.push_bind(user_id);
        builder.push(" OR p.user_id IN (SELECT user_id FROM followers WHERE follower_id = ");
        builder.push_bind(user_id);
        builder.push("))");

        let tags = query.tag_list();
        if !tags.is_empty() {
            builder.push(" AND p.tags @> ");
            builder.push_bind(tags);
        }

        if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = format!("%{}%", escape_like(search));
            builder.push(" AND (p.title ILIKE ");
            builder.push_bind(pattern.clone());
            builder.push(r" ESCAPE '\' OR p.content ILIKE ");
            builder.push_bind(pattern);
            builder.push(r" ESCAPE '\')");
        }

        let direction = match query.sort {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        builder.push(format!(
            " GROUP BY p.id, u.username ORDER BY p.created_at {direction}, p.id {direction}"
        ));
        builder.push(" LIMIT ");
        builder.push_bind(query.limit);
        builder.push(" OFFSET ");
        builder.push_bind(query.offset);

        let rows = builder
            .build_query_as::<FeedRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("get_user_feed", e))?;

        Ok(rows
            .into_iter()
            .map(|row| FeedItem {
                post: row.post.into(),
                username: row.username,
                comments_count: row.comments_count,
            })
            .collect())
    }
}
