use chrono::Utc;
use social_api::{
    error::{ConflictKind, StoreError},
    models::{FeedQuery, NewPost, NewUser, PostChanges, User},
    repository::{PostgresRepository, Repository, escape_like},
};
use sqlx::PgPool;
use uuid::Uuid;

// These tests talk to a real Postgres. Run them with
// `DATABASE_URL=... cargo test -- --ignored`.

// --- Test Context and Setup ---

struct DbTestContext {
    pool: PgPool,
}

impl DbTestContext {
    async fn setup() -> Self {
        dotenv::dotenv().ok();

        let db_url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set to run integration tests");

        let pool = PgPool::connect(&db_url)
            .await
            .expect("Failed to connect to database for integration tests.");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run database migrations.");

        DbTestContext { pool }
    }

    fn repository(&self) -> PostgresRepository {
        PostgresRepository::new(self.pool.clone())
    }

    async fn invitations_for(&self, user_id: i64) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM user_invitations WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count invitations")
    }
}

// --- Test Data Helpers ---

/// A user with a unique username and email, so reruns never collide.
fn new_user(prefix: &str) -> NewUser {
    let suffix = Uuid::new_v4().simple().to_string();
    NewUser {
        username: format!("{}-{}", prefix, &suffix[..12]),
        email: format!("{}-{}@test.com", prefix, suffix),
        password_hash: "hash".to_string(),
    }
}

async fn create_invited_user(repo: &PostgresRepository, prefix: &str) -> (User, String) {
    let token_hash = Uuid::new_v4().simple().to_string();
    let user = repo
        .create_and_invite(
            new_user(prefix),
            &token_hash,
            Utc::now() + chrono::Duration::days(1),
        )
        .await
        .expect("Failed to create test user");
    (user, token_hash)
}

async fn create_active_user(repo: &PostgresRepository, prefix: &str) -> User {
    let (user, token_hash) = create_invited_user(repo, prefix).await;
    repo.activate(&token_hash)
        .await
        .expect("Failed to activate test user");
    repo.get_user_by_id(user.id).await.unwrap()
}

fn new_post(user_id: i64, title: &str, tags: &[&str]) -> NewPost {
    NewPost {
        user_id,
        title: title.to_string(),
        content: "body".to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

// --- Query Helpers ---

#[test]
fn test_escape_like_neutralizes_wildcards() {
    assert_eq!(escape_like("50%"), r"50\%");
    assert_eq!(escape_like("snake_case"), r"snake\_case");
    assert_eq!(escape_like(r"a\b"), r"a\\b");
    assert_eq!(escape_like("plain"), "plain");
}

// --- Users & Invitations ---

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_create_and_invite_then_activate() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();

    let (user, token_hash) = create_invited_user(&repo, "invite").await;
    assert!(!user.is_active);
    assert_eq!(user.role.name, "user");

    let credentials = repo.get_credentials_by_email(&user.email).await;
    assert_eq!(credentials.unwrap_err(), StoreError::NotFound);

    assert_eq!(repo.activate(&token_hash).await, Ok(user.id));
    assert_eq!(repo.activate(&token_hash).await, Err(StoreError::NotFound));

    let credentials = repo.get_credentials_by_email(&user.email).await.unwrap();
    assert_eq!(credentials.user.id, user.id);
    assert_eq!(credentials.password_hash, "hash");
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_expired_invitation_is_not_found() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let token_hash = Uuid::new_v4().simple().to_string();

    let user = repo
        .create_and_invite(
            new_user("expired"),
            &token_hash,
            Utc::now() - chrono::Duration::seconds(1),
        )
        .await
        .unwrap();

    assert_eq!(repo.activate(&token_hash).await, Err(StoreError::NotFound));
    assert!(!repo.get_user_by_id(user.id).await.unwrap().is_active);
    assert_eq!(ctx.invitations_for(user.id).await, 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_duplicate_email_and_username_are_conflicts() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let (user, _) = create_invited_user(&repo, "dup").await;

    let mut same_email = new_user("dup2");
    same_email.email = user.email.clone();
    let result = repo
        .create_and_invite(same_email, "t1", Utc::now())
        .await;
    assert_eq!(
        result.unwrap_err(),
        StoreError::Conflict(ConflictKind::DuplicateEmail)
    );

    let mut same_username = new_user("dup3");
    same_username.username = user.username.clone();
    let result = repo
        .create_and_invite(same_username, "t2", Utc::now())
        .await;
    assert_eq!(
        result.unwrap_err(),
        StoreError::Conflict(ConflictKind::DuplicateUsername)
    );
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_delete_user_removes_invitation() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let (user, token_hash) = create_invited_user(&repo, "delete").await;

    assert_eq!(repo.delete_user(user.id).await, Ok(()));

    assert_eq!(
        repo.get_user_by_id(user.id).await.unwrap_err(),
        StoreError::NotFound
    );
    assert_eq!(repo.activate(&token_hash).await, Err(StoreError::NotFound));
    assert_eq!(repo.delete_user(user.id).await, Err(StoreError::NotFound));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_set_user_role() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let user = create_active_user(&repo, "role").await;

    let updated = repo.set_user_role(user.id, "moderator").await.unwrap();
    assert_eq!(updated.role.name, "moderator");
    assert_eq!(updated.role.level, 2);

    assert_eq!(
        repo.get_role_by_name("nope").await.unwrap_err(),
        StoreError::NotFound
    );
}

// --- Posts ---

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_update_post_with_version() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let user = create_active_user(&repo, "poster").await;
    let post = repo
        .create_post(new_post(user.id, "v0", &["rust"]))
        .await
        .unwrap();
    assert_eq!(post.version, 0);

    let changes = PostChanges {
        title: "v1".to_string(),
        content: "edited".to_string(),
    };
    assert_eq!(
        repo.update_post_with_version(post.id, 0, changes.clone()).await,
        Ok(1)
    );
    assert_eq!(
        repo.update_post_with_version(post.id, 0, changes.clone()).await,
        Err(StoreError::StaleVersion)
    );
    assert_eq!(
        repo.update_post_with_version(i64::MAX, 0, changes).await,
        Err(StoreError::NotFound)
    );

    let stored = repo.get_post(post.id).await.unwrap();
    assert_eq!(stored.title, "v1");
    assert_eq!(stored.version, 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_comments_and_post_deletion() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let user = create_active_user(&repo, "commenter").await;
    let post = repo.create_post(new_post(user.id, "talk", &[])).await.unwrap();

    let comment = repo.create_comment(post.id, user.id, "hello").await.unwrap();
    assert_eq!(comment.username, user.username);

    let comments = repo.get_comments_by_post(post.id).await.unwrap();
    assert_eq!(comments.len(), 1);

    assert_eq!(
        repo.create_comment(i64::MAX, user.id, "orphan")
            .await
            .unwrap_err(),
        StoreError::NotFound
    );

    assert_eq!(repo.delete_post(post.id).await, Ok(()));
    assert_eq!(repo.delete_post(post.id).await, Err(StoreError::NotFound));
}

// --- Follower Graph & Feed ---

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_follow_and_feed() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let reader = create_active_user(&repo, "reader").await;
    let author = create_active_user(&repo, "author").await;
    let stranger = create_active_user(&repo, "stranger").await;

    repo.create_post(new_post(reader.id, "mine", &["a"]))
        .await
        .unwrap();
    let followed = repo
        .create_post(new_post(author.id, "followed", &["a", "b"]))
        .await
        .unwrap();
    repo.create_post(new_post(stranger.id, "hidden", &["a"]))
        .await
        .unwrap();

    assert_eq!(repo.follow(reader.id, author.id).await, Ok(()));
    assert_eq!(
        repo.follow(reader.id, author.id).await,
        Err(StoreError::Conflict(ConflictKind::DuplicateFollow))
    );
    assert_eq!(
        repo.follow(reader.id, i64::MAX).await,
        Err(StoreError::NotFound)
    );

    let feed = repo
        .get_user_feed(reader.id, &FeedQuery::default())
        .await
        .unwrap();
    let titles: Vec<&str> = feed.iter().map(|item| item.post.title.as_str()).collect();
    assert_eq!(titles, vec!["followed", "mine"]);

    let tagged = FeedQuery {
        tags: Some("b".to_string()),
        ..FeedQuery::default()
    };
    let feed = repo.get_user_feed(reader.id, &tagged).await.unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].post.id, followed.id);
    assert_eq!(feed[0].username, author.username);

    assert_eq!(repo.unfollow(reader.id, author.id).await, Ok(()));
    assert_eq!(
        repo.unfollow(reader.id, author.id).await,
        Err(StoreError::NotFound)
    );
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_feed_search_matches_wildcards_literally() {
    let ctx = DbTestContext::setup().await;
    let repo = ctx.repository();
    let reader = create_active_user(&repo, "searcher").await;

    let literal = repo
        .create_post(new_post(reader.id, "50% off", &[]))
        .await
        .unwrap();
    repo.create_post(new_post(reader.id, "500 items", &[]))
        .await
        .unwrap();

    let query = FeedQuery {
        search: Some("50%".to_string()),
        ..FeedQuery::default()
    };
    let feed = repo.get_user_feed(reader.id, &query).await.unwrap();

    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].post.id, literal.id);
}
