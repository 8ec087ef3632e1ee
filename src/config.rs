use std::{env, time::Duration};

/// AppConfig
///
/// Holds the application's entire configuration state. Immutable once loaded and
/// cloned into the shared `AppState`, so every request sees the same settings.
#[derive(Clone, Debug)]
pub struct AppConfig {
    // Runtime environment marker. Controls log format, mail sandboxing and
    // whether invitation tokens are echoed back on registration.
    pub env: Env,
    // Address the HTTP server binds to.
    pub addr: String,
    // Postgres connection string. `None` in local mode runs against the in-memory store.
    pub db_url: Option<String>,
    // Base URL used to build activation links.
    pub frontend_url: String,
    pub auth: AuthConfig,
    pub mail: MailConfig,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CachePolicy,
    // Overall budget for a single request, enforced by the pipeline.
    pub request_timeout: Duration,
    // Narrower budget for each store round-trip.
    pub query_timeout: Duration,
    pub bcrypt_cost: u32,
}

/// Env
///
/// Defines the runtime context, used to switch between development conveniences
/// and production-grade infrastructure.
#[derive(Clone, PartialEq, Debug)]
pub enum Env {
    Local,
    Production,
}

/// AuthConfig
///
/// Signing material and lifetime for issued bearer tokens.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub secret: String,
    pub issuer: String,
    pub token_exp: Duration,
}

/// MailConfig
#[derive(Clone, Debug)]
pub struct MailConfig {
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
    // How long an invitation token stays redeemable.
    pub invitation_exp: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub welcome_template_id: String,
}

/// RedisConfig
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub addr: String,
    pub enabled: bool,
}

/// RateLimitConfig
///
/// Fixed-window admission control, keyed by client address.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_window: u32,
    pub window: Duration,
}

/// CachePolicy
///
/// Identity-cache settings. With `invalidate_on_write` off, cached identities are
/// only refreshed on miss and may be stale for up to `ttl` after a role change or
/// activation.
#[derive(Clone, Debug)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub invalidate_on_write: bool,
}

const LOCAL_JWT_SECRET: &str = "super-secure-test-secret-value-local";

impl Default for AppConfig {
    /// default
    ///
    /// A safe, non-panicking configuration for tests: in-memory store, no Redis,
    /// rate limiting off, a fast bcrypt cost.
    fn default() -> Self {
        Self {
            env: Env::Local,
            addr: "0.0.0.0:8000".to_string(),
            db_url: None,
            frontend_url: "http://localhost:5173".to_string(),
            auth: AuthConfig {
                secret: LOCAL_JWT_SECRET.to_string(),
                issuer: "social-api".to_string(),
                token_exp: Duration::from_secs(3 * 24 * 3600),
            },
            mail: MailConfig {
                api_key: String::new(),
                from_email: "hello@localhost".to_string(),
                from_name: "Social".to_string(),
                invitation_exp: Duration::from_secs(3 * 24 * 3600),
                max_retries: 3,
                retry_base_delay: Duration::from_secs(1),
                welcome_template_id: "user-welcome".to_string(),
            },
            redis: RedisConfig {
                addr: "redis://127.0.0.1:6379/0".to_string(),
                enabled: false,
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                requests_per_window: 20,
                window: Duration::from_secs(5),
            },
            cache: CachePolicy {
                ttl: Duration::from_secs(60),
                invalidate_on_write: false,
            },
            request_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(5),
            bcrypt_cost: 4,
        }
    }
}

impl AppConfig {
    /// load
    ///
    /// Reads the configuration from environment variables and applies the
    /// **fail-fast** principle for production secrets.
    ///
    /// # Panics
    /// Panics if a variable required in production is missing, if a numeric or
    /// boolean variable cannot be parsed, or if the rate-limit window is zero.
    pub fn load() -> Self {
        let env = match env::var("APP_ENV").as_deref() {
            Ok("production") => Env::Production,
            _ => Env::Local,
        };
        let defaults = Self::default();

        let (db_url, secret, api_key, from_email) = match env {
            Env::Production => (
                Some(env::var("DATABASE_URL").expect("FATAL: DATABASE_URL required in prod")),
                env::var("JWT_SECRET").expect("FATAL: JWT_SECRET must be set in production."),
                env::var("SENDGRID_API_KEY").expect("FATAL: SENDGRID_API_KEY required in prod"),
                env::var("FROM_EMAIL").expect("FATAL: FROM_EMAIL required in prod"),
            ),
            Env::Local => (
                env::var("DATABASE_URL").ok(),
                env::var("JWT_SECRET").unwrap_or_else(|_| LOCAL_JWT_SECRET.to_string()),
                env::var("SENDGRID_API_KEY").unwrap_or_default(),
                env::var("FROM_EMAIL").unwrap_or(defaults.mail.from_email.clone()),
            ),
        };

        Self {
            addr: env::var("ADDR").unwrap_or(defaults.addr),
            db_url,
            frontend_url: env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            auth: AuthConfig {
                secret,
                issuer: env::var("JWT_ISSUER").unwrap_or(defaults.auth.issuer),
                token_exp: secs_var("TOKEN_EXP_SECS", defaults.auth.token_exp),
            },
            mail: MailConfig {
                api_key,
                from_email,
                from_name: env::var("FROM_NAME").unwrap_or(defaults.mail.from_name),
                invitation_exp: secs_var("INVITATION_EXP_SECS", defaults.mail.invitation_exp),
                max_retries: parsed_var("MAIL_MAX_RETRIES", defaults.mail.max_retries),
                retry_base_delay: millis_var(
                    "MAIL_RETRY_BASE_DELAY_MS",
                    defaults.mail.retry_base_delay,
                ),
                welcome_template_id: env::var("SENDGRID_WELCOME_TEMPLATE_ID")
                    .unwrap_or(defaults.mail.welcome_template_id),
            },
            redis: RedisConfig {
                addr: env::var("REDIS_ADDR").unwrap_or(defaults.redis.addr),
                enabled: parsed_var("REDIS_ENABLED", env == Env::Production),
            },
            rate_limit: RateLimitConfig {
                enabled: parsed_var("RATE_LIMIT_ENABLED", true),
                requests_per_window: parsed_var(
                    "RATE_LIMIT_REQUESTS",
                    defaults.rate_limit.requests_per_window,
                ),
                window: nonzero_secs_var("RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window),
            },
            cache: CachePolicy {
                ttl: secs_var("CACHE_TTL_SECS", defaults.cache.ttl),
                invalidate_on_write: parsed_var("CACHE_INVALIDATE_ON_WRITE", false),
            },
            request_timeout: secs_var("REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            query_timeout: secs_var("QUERY_TIMEOUT_SECS", defaults.query_timeout),
            bcrypt_cost: parsed_var("BCRYPT_COST", bcrypt::DEFAULT_COST),
            env,
        }
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("FATAL: {key} has an invalid value: {raw}")),
        Err(_) => default,
    }
}

fn secs_var(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed_var(key, default.as_secs()))
}

fn nonzero_secs_var(key: &str, default: Duration) -> Duration {
    let value = secs_var(key, default);
    if value.is_zero() {
        panic!("FATAL: {key} must be greater than zero");
    }
    value
}

fn millis_var(key: &str, default: Duration) -> Duration {
    Duration::from_millis(parsed_var(key, default.as_millis() as u64))
}
