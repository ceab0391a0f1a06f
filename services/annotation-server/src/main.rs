use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use annotation_server::{
    build_router, build_search_engine,
    config::{AppConfig, SearchEngineKind},
    search_sync, state::AppState, webhooks, worker_loop,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::from_env()?;

    // --- Postgres ---
    let pg_pool = PgPool::connect(&cfg.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    sqlx::migrate!("./migrations")
        .run(&pg_pool)
        .await
        .context("Failed to run migrations")?;

    bootstrap_owner(&cfg, &pg_pool).await?;

    // --- Search engine ---
    let search = build_search_engine(&cfg);
    let engine = search.info();
    if let Err(e) = search.ping().await {
        tracing::warn!(engine=%engine.name, "search engine not reachable at startup: {e}");
    }

    // In-memory indices do not survive a restart.
    if cfg.search_engine == SearchEngineKind::Memory {
        search_sync::rebuild_indexes(&pg_pool, search.as_ref())
            .await
            .context("Failed to rebuild search indexes")?;
    }

    let app_state = Arc::new(AppState::new(pg_pool, cfg.clone(), search));

    tokio::spawn(worker_loop::run_worker_loop(app_state.clone()));
    tokio::spawn(webhooks::run_webhook_dispatcher(app_state.clone()));

    let app = build_router(app_state);

    let addr = &cfg.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr=%addr, engine=%engine.name, "annotation-server listening");
    axum::serve(listener, app).await.context("HTTP server failed")?;

    Ok(())
}

/// Creates or refreshes the owner account named by `OWNER_USERNAME`.
async fn bootstrap_owner(cfg: &AppConfig, pg_pool: &PgPool) -> Result<()> {
    let (Some(username), Some(api_key)) = (&cfg.owner_username, &cfg.owner_api_key) else {
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO users (id, username, role, api_key)
        VALUES ($1, $2, 'owner', $3)
        ON CONFLICT (username) DO UPDATE
        SET role = 'owner', api_key = EXCLUDED.api_key, updated_at = NOW()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(api_key)
    .execute(pg_pool)
    .await
    .context("Failed to bootstrap owner user")?;

    info!(username=%username, "owner user ready");
    Ok(())
}
