//! topicfed binary entry point

use std::sync::Arc;
use std::time::Duration;

use topicfed::data::Database;
use topicfed::federation::{Federation, LocalScheduler, default_registry, run_worker};
use topicfed::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Connect to the database and build the federation engine
/// 4. Start background tasks (job worker, rate limit pruning)
/// 5. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("topicfed={},tower_http=debug", config.logging.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Starting topicfed..."
    );

    topicfed::metrics::init_metrics();

    // 3. Database and federation engine
    let db = Arc::new(Database::connect(&config.database.path).await?);
    tracing::info!("Database connected");

    let (scheduler, jobs) = LocalScheduler::new();
    let federation = Arc::new(Federation::new(
        db,
        config.federation.clone(),
        &config.server.base_url(),
        default_registry(),
        Arc::new(scheduler),
    )?);

    let state = AppState::new(config.clone(), federation.clone());

    // 4. Background tasks
    tokio::spawn(run_worker(federation, jobs));
    spawn_rate_limit_pruning(state.clone());

    // 5. HTTP server
    let app = topicfed::build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Spawn background task dropping expired rate limit windows
fn spawn_rate_limit_pruning(state: AppState) {
    let interval_secs = state.config.federation.rate_limit_window_seconds.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            state.rate_limiter.prune().await;
        }
    });

    tracing::debug!("Rate limit pruning task spawned");
}
