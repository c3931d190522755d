//! Prometheus metrics endpoint

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::data::store;
use crate::metrics::{QUARANTINED_DOMAINS, REGISTRY};

/// Returns all metrics in Prometheus text format.
///
/// The quarantine gauge is reloaded from the actor table on every scrape.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    if let Err(error) = refresh_quarantined_domains(&state).await {
        tracing::warn!(%error, "Failed to refresh quarantined domain count");
    }

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn refresh_quarantined_domains(state: &AppState) -> Result<(), crate::error::AppError> {
    let mut conn = state.federation.db().acquire().await?;
    let count = store::count_quarantined_domains(&mut conn).await?;
    QUARANTINED_DOMAINS.set(count);
    Ok(())
}

/// Create metrics router exposing `/metrics`.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
