use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::Method;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use sc_domain::config::Settings;
use sc_gateway::api;
use sc_gateway::bus::RedisBus;
use sc_gateway::chat::ChatService;
use sc_gateway::registry::SessionRegistry;
use sc_gateway::runtime::ChatStreamRuntime;
use sc_gateway::state::AppState;
use sc_gateway::store::PgMessageStore;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "sidecar", about = "Chat sidecar mediating HTTP clients and sandboxed agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the HTTP server (the default).
    Serve,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let settings = Settings::from_env().context("reading settings from environment")?;
            run_server(Arc::new(settings)).await
        }
        Some(Command::Version) => {
            println!("sidecar {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing, filtered by `RUST_LOG`.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sc_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(settings: Arc<Settings>) -> anyhow::Result<()> {
    tracing::info!("sidecar starting");

    // ── Database ─────────────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await
        .context("connecting to Postgres")?;
    let store = Arc::new(PgMessageStore::new(pool));
    tracing::info!("database pool ready");

    // ── Live bus ─────────────────────────────────────────────────────
    let bus = Arc::new(
        RedisBus::connect(&settings.redis_url)
            .await
            .context("connecting to Redis")?,
    );
    tracing::info!("live bus ready");

    // ── Session registry + stream runtime ────────────────────────────
    let registry = Arc::new(SessionRegistry::new());
    let runtime = Arc::new(ChatStreamRuntime::new(
        settings.clone(),
        store.clone(),
        bus.clone(),
        registry.clone(),
    ));
    let chat = Arc::new(ChatService::new(
        store.clone(),
        bus.clone(),
        runtime.clone(),
        registry.clone(),
    ));
    tracing::info!("session registry + stream runtime ready");

    // ── Idle session reaper ──────────────────────────────────────────
    {
        let registry = registry.clone();
        let ttl = Duration::from_secs(settings.session_ttl_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                interval.tick().await;
                registry.reap_idle(ttl).await;
            }
        });
    }
    tracing::info!(
        ttl_seconds = settings.session_ttl_seconds,
        "idle reaper started (60s tick)"
    );

    // ── Router ───────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    // Backpressure: cap concurrent in-flight requests.
    let max_concurrent = std::env::var("SIDECAR_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    let state = AppState { settings: settings.clone(), chat };
    let app = api::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding to {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "sidecar listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // ── Shutdown: tear down every live agent session ─────────────────
    registry.terminate_all().await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
}
