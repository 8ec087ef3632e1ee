use social_api::{
    AppState,
    cache::{CacheState, MemoryCache, RedisCache},
    config::{AppConfig, Env},
    create_router,
    mailer::{MailerState, SendGridMailer},
    repository::{InMemoryRepository, PostgresRepository, RepositoryState},
};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// main
///
/// Initializes configuration, logging, the store, the cache and the mailer, then
/// serves the API until Ctrl-C.
#[tokio::main]
async fn main() {
    // 1. Configuration & Environment Loading (Fail-Fast)
    dotenv::dotenv().ok();
    let config = AppConfig::load();

    // 2. Logging Filter Setup
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "social_api=debug,tower_http=info".into());

    // 3. Initialize Logging based on Environment
    match config.env {
        Env::Local => {
            // LOCAL: Pretty print output for human readability.
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        Env::Production => {
            // PROD: JSON lines for log aggregation.
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }

    tracing::info!("Application starting in {:?} mode", config.env);

    // 4. Durable Store
    // Postgres when DATABASE_URL is set; local runs may fall back to the in-memory store.
    let repo: RepositoryState = match &config.db_url {
        Some(db_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(30)
                .connect(db_url)
                .await
                .expect("FATAL: Failed to connect to Postgres. Check DATABASE_URL.");

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("FATAL: Failed to apply database migrations.");

            tracing::info!("Database connection pool established");
            Arc::new(PostgresRepository::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(InMemoryRepository::new())
        }
    };

    // 5. Identity Cache
    let cache: CacheState = if config.redis.enabled {
        let redis = RedisCache::connect(&config.redis.addr)
            .await
            .expect("FATAL: Failed to connect to Redis. Check REDIS_ADDR.");
        Arc::new(redis)
    } else {
        tracing::info!("Redis disabled, using the in-process cache");
        Arc::new(MemoryCache::new())
    };

    // 6. Mailer
    // Sandbox mode everywhere except production.
    let mailer: MailerState = Arc::new(SendGridMailer::new(
        config.mail.clone(),
        config.env != Env::Production,
    ));

    // 7. Unified State Assembly
    let addr = config.addr.clone();
    let app_state = AppState::new(config, repo, cache, mailer);

    // Idle rate-limit windows are dropped once per window length.
    if let Some(limiter) = app_state.pipeline.limiter().cloned() {
        let every = app_state.config.rate_limit.window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let purged = limiter.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "expired rate-limit windows dropped");
                }
            }
        });
    }

    // 8. Router and Server Startup
    let app = create_router(app_state);

    let listener = TcpListener::bind(&addr)
        .await
        .expect("FATAL: Failed to bind the HTTP listener. Check ADDR.");

    tracing::info!("Listening on {}", addr);
    tracing::info!("API Documentation (Swagger UI) available at: http://{}/swagger-ui", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("FATAL: HTTP server error");

    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for the shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}
