use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    AppConfig,
    auth::{TokenCodec, hash_invitation_token, hash_password, verify_password},
    error::{ApiError, RegistrationError, StoreError},
    identity::IdentityResolver,
    mailer::{MailerState, Template},
    models::{Comment, Id, NewPost, NewUser, Post, PostChanges, RegisterUserRequest, User},
    pipeline::RequestContext,
    repository::RepositoryState,
};

/// Registration
///
/// Outcome of a completed registration saga: the inactive user and the plaintext
/// invitation token that was mailed to them.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    pub token: String,
}

/// MutationCoordinator
///
/// Owns every state-changing operation against the durable store. Each store
/// round-trip is bounded by the narrower of the request deadline and the query
/// timeout.
#[derive(Clone)]
pub struct MutationCoordinator {
    repo: RepositoryState,
    mailer: MailerState,
    resolver: IdentityResolver,
    codec: TokenCodec,
    frontend_url: String,
    invitation_exp: Duration,
    query_timeout: Duration,
    bcrypt_cost: u32,
}

impl MutationCoordinator {
    pub fn new(
        config: &AppConfig,
        repo: RepositoryState,
        mailer: MailerState,
        resolver: IdentityResolver,
    ) -> Self {
        Self {
            repo,
            mailer,
            resolver,
            codec: TokenCodec::new(&config.auth),
            frontend_url: config.frontend_url.trim_end_matches('/').to_string(),
            invitation_exp: config.mail.invitation_exp,
            query_timeout: config.query_timeout,
            bcrypt_cost: config.bcrypt_cost,
        }
    }

    fn query_ctx(&self, ctx: &RequestContext) -> RequestContext {
        ctx.narrowed(self.query_timeout)
    }

    // --- Identity Lifecycle ---

    /// register
    ///
    /// Registration saga:
    /// 1. hash the password;
    /// 2. create the inactive user and its invitation atomically;
    /// 3. send the welcome mail outside the transaction;
    /// 4. if delivery fails, delete the user once as compensation.
    ///
    /// A failed compensation is logged and the caller still receives the
    /// delivery error; the orphaned inactive user can never log in and its
    /// invitation expires on its own.
    #[tracing::instrument(skip(self, ctx, req), fields(username = %req.username, email = %req.email))]
    pub async fn register(
        &self,
        ctx: &RequestContext,
        req: RegisterUserRequest,
    ) -> Result<Registration, RegistrationError> {
        let password_hash = hash_password(req.password, self.bcrypt_cost)
            .await
            .map_err(RegistrationError::Hashing)?;

        let token = Uuid::new_v4().to_string();
        let token_hash = hash_invitation_token(&token);
        let expiry = Utc::now()
            + chrono::Duration::from_std(self.invitation_exp)
                .unwrap_or_else(|_| chrono::Duration::days(3));

        let new_user = NewUser {
            username: req.username,
            email: req.email,
            password_hash,
        };
        let user = self
            .query_ctx(ctx)
            .run(self.repo.create_and_invite(new_user, &token_hash, expiry))
            .await?;

        let vars = json!({
            "username": user.username,
            "activationURL": format!("{}/confirm/{}", self.frontend_url, token),
        });

        match ctx
            .run(
                self.mailer
                    .send(Template::UserWelcome, &user.username, &user.email, vars),
            )
            .await
        {
            Ok(status) => {
                tracing::info!(user_id = user.id, status, "invitation sent");
                Ok(Registration { user, token })
            }
            Err(delivery) => {
                tracing::error!(user_id = user.id, "invitation delivery failed: {}", delivery);
                self.compensate_registration(user.id).await;
                Err(RegistrationError::Delivery(delivery))
            }
        }
    }

    // Runs under its own query budget so an expired request deadline does not
    // also cancel the rollback.
    async fn compensate_registration(&self, user_id: Id) {
        let ctx = RequestContext::new(self.query_timeout);
        match ctx.run(self.repo.delete_user(user_id)).await {
            Ok(()) => tracing::info!(user_id, "registration rolled back"),
            Err(e) => tracing::error!(user_id, "registration rollback failed: {}", e),
        }
    }

    /// activate
    ///
    /// Redeems an invitation token. Unknown, expired and already-used tokens are
    /// all `NotFound`.
    #[tracing::instrument(skip(self, ctx, token))]
    pub async fn activate(&self, ctx: &RequestContext, token: &str) -> Result<Id, StoreError> {
        let user_id = self
            .query_ctx(ctx)
            .run(self.repo.activate(&hash_invitation_token(token)))
            .await?;

        tracing::info!(user_id, "user activated");
        self.resolver.identity_written(ctx, user_id).await;
        Ok(user_id)
    }

    /// issue_token
    ///
    /// Password login. Unknown email, inactive user and wrong password are
    /// indistinguishable to the caller.
    #[tracing::instrument(skip(self, ctx, password))]
    pub async fn issue_token(
        &self,
        ctx: &RequestContext,
        email: &str,
        password: String,
    ) -> Result<String, ApiError> {
        let credentials = match self
            .query_ctx(ctx)
            .run(self.repo.get_credentials_by_email(email))
            .await
        {
            Ok(credentials) => credentials,
            Err(StoreError::NotFound) => return Err(ApiError::InvalidCredential),
            Err(e) => return Err(e.into()),
        };

        if !verify_password(password, credentials.password_hash).await {
            tracing::info!(user_id = credentials.user.id, "password mismatch");
            return Err(ApiError::InvalidCredential);
        }

        let claims = self.codec.claims_for(credentials.user.id);
        Ok(self.codec.encode(&claims)?)
    }

    /// change_role
    ///
    /// Assigns a catalog role to a user. An unknown role name is a bad request,
    /// not a missing user.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn change_role(
        &self,
        ctx: &RequestContext,
        user_id: Id,
        role_name: &str,
    ) -> Result<User, ApiError> {
        match self
            .query_ctx(ctx)
            .run(self.repo.get_role_by_name(role_name))
            .await
        {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                return Err(ApiError::BadRequest(format!("unknown role '{}'", role_name)));
            }
            Err(e) => return Err(e.into()),
        }

        let user = self
            .query_ctx(ctx)
            .run(self.repo.set_user_role(user_id, role_name))
            .await?;

        tracing::info!(user_id, role = %role_name, "role changed");
        self.resolver.identity_written(ctx, user_id).await;
        Ok(user)
    }

    // --- Posts ---

    #[tracing::instrument(skip(self, ctx, post), fields(user_id = post.user_id))]
    pub async fn create_post(&self, ctx: &RequestContext, post: NewPost) -> Result<Post, StoreError> {
        self.query_ctx(ctx).run(self.repo.create_post(post)).await
    }

    /// update_post
    ///
    /// Optimistic update against `expected_version`. Returns the new version.
    /// A `StaleVersion` is handed straight back; the caller re-reads and decides.
    #[tracing::instrument(skip(self, ctx, changes))]
    pub async fn update_post(
        &self,
        ctx: &RequestContext,
        post_id: Id,
        expected_version: i32,
        changes: PostChanges,
    ) -> Result<i32, StoreError> {
        let result = self
            .query_ctx(ctx)
            .run(
                self.repo
                    .update_post_with_version(post_id, expected_version, changes),
            )
            .await;

        if let Err(StoreError::StaleVersion) = &result {
            tracing::info!(post_id, expected_version, "post update lost a version race");
        }
        result
    }

    #[tracing::instrument(skip(self, ctx))]
    pub async fn delete_post(&self, ctx: &RequestContext, post_id: Id) -> Result<(), StoreError> {
        self.query_ctx(ctx).run(self.repo.delete_post(post_id)).await
    }

    #[tracing::instrument(skip(self, ctx, content))]
    pub async fn create_comment(
        &self,
        ctx: &RequestContext,
        post_id: Id,
        user_id: Id,
        content: &str,
    ) -> Result<Comment, StoreError> {
        self.query_ctx(ctx)
            .run(self.repo.create_comment(post_id, user_id, content))
            .await
    }

    // --- Follower Graph ---

    #[tracing::instrument(skip(self, ctx))]
    pub async fn follow(
        &self,
        ctx: &RequestContext,
        follower_id: Id,
        followed_id: Id,
    ) -> Result<(), StoreError> {
        self.query_ctx(ctx)
            .run(self.repo.follow(follower_id, followed_id))
            .await
    }

    #[tracing::instrument(skip(self, ctx))]
    pub async fn unfollow(
        &self,
        ctx: &RequestContext,
        follower_id: Id,
        followed_id: Id,
    ) -> Result<(), StoreError> {
        self.query_ctx(ctx)
            .run(self.repo.unfollow(follower_id, followed_id))
            .await
    }
}
