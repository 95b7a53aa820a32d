mod auth;
mod cache;
mod config;
mod db;
mod dispatch;
mod errors;
mod llm_client;
mod routes;
mod rpc;
mod state;
mod store;
mod tools;
mod watermark;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::AuthService;
use crate::cache::CacheService;
use crate::config::Config;
use crate::db::create_pool;
use crate::dispatch::registry::ToolRegistry;
use crate::dispatch::Dispatcher;
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::Store;
use crate::watermark::WatermarkService;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Vitae API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let pool = create_pool(&config.database_url).await?;
    let store = Store::new(pool);

    // Initialize Redis (durable cache tier)
    let redis = redis::Client::open(config.redis_url.clone())?;
    let redis_conn = redis.get_connection_manager().await?;
    info!("Redis connection established");

    // Initialize LLM client
    let llm = LlmClient::new(config.anthropic_api_key.clone());
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    // Core services
    let auth = Arc::new(AuthService::new(store.clone()));
    let cache = Arc::new(CacheService::new(redis_conn));
    let watermark = Arc::new(WatermarkService::new(
        Arc::new(store.clone()),
        config.watermark_seed,
    ));

    // Periodic reclaim of expired watermark transactions; every response
    // inserts a row and only a matched scan deletes one, so the table is
    // unbounded without this.
    let reclaimer = watermark.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(e) = reclaimer.reclaim_expired().await {
                tracing::warn!("watermark reclaim failed: {e}");
            }
        }
    });

    // Register the method set and build the one dispatcher for the process
    let mut registry = ToolRegistry::new();
    tools::register_all(&mut registry, store.clone(), llm, auth.clone(), watermark.clone())
        .map_err(|e| anyhow::anyhow!("tool registration failed: {e}"))?;
    info!("Registered {} methods", registry.method_names().len());

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        auth,
        cache,
        watermark,
        store,
        config.dev_mode,
    ));

    let state = AppState {
        config: config.clone(),
        dispatcher,
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS once the web client's origin is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
