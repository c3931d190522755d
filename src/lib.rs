//! topicfed - federates forum topics and posts over ActivityPub
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inboxes, read endpoints, WebFinger, metrics              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Engine                         │
//! │  - Envelope, typed documents, handler registry              │
//! │  - Six-stage pipeline, delivery, context, import            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): federation graph and host content         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation engine
//! - `data`: Database layer
//! - `notify`: Content change notifications
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod notify;

use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Federation engine
    pub federation: Arc<federation::Federation>,

    /// Per-domain inbox rate limiter
    pub rate_limiter: Arc<federation::RateLimiter>,
}

impl AppState {
    pub fn new(config: config::AppConfig, federation: Arc<federation::Federation>) -> Self {
        let rate_limiter = federation::RateLimiter::new(
            config.federation.rate_limit_max_requests,
            Duration::from_secs(config.federation.rate_limit_window_seconds),
        );

        Self {
            config: Arc::new(config),
            federation,
            rate_limiter: Arc::new(rate_limiter),
        }
    }
}

/// Largest inbound request body accepted.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::metrics_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
