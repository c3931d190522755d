//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::data::store;
use crate::error::AppError;
use crate::federation::webfinger::{JRD_JSON, generate_webfinger_response, parse_address};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local Group and Person actors.
///
/// Query: ?resource=acct:name@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    if !query.resource.starts_with("acct:") {
        return Err(AppError::Validation(
            "Resource must start with 'acct:'".to_string(),
        ));
    }
    let (username, domain) = parse_address(&query.resource)?;

    if !domain.eq_ignore_ascii_case(state.federation.domain()) {
        return Err(AppError::NotFound);
    }

    let mut conn = state.federation.db().acquire().await?;
    let actor = store::find_local_actor_by_username(&mut conn, username)
        .await?
        .ok_or(AppError::NotFound)?;
    let actor_username = actor.username.as_deref().unwrap_or(username);

    let jrd = generate_webfinger_response(actor_username, state.federation.domain(), &actor.ap_id);
    let body = serde_json::to_string(&jrd)?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, JRD_JSON)], body).into_response())
}
