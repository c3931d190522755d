//! ActivityPub endpoints
//!
//! - Shared inbox and per-actor inboxes
//! - Stored documents of local actors, objects, activities and collections
//! - Outbox and followers collections of local actors

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde_json::{Value, json};

use crate::AppState;
use crate::data::{ActorRecord, store};
use crate::error::AppError;
use crate::federation::delivery::builder::{actor_document, followers_of, ordered_collection};
use crate::federation::envelope::{ACTIVITY_JSON, AS_CONTEXT};
use crate::federation::signature::{extract_signature_key_id, key_id_matches_actor, verify_signature};
use crate::federation::types::reference_id;
use crate::federation::{Origin, extract_domain, parse_envelope};
use crate::metrics::ACTIVITIES_RECEIVED;

/// Items listed in an outbox response.
const OUTBOX_PAGE_SIZE: i64 = 20;

/// Create ActivityPub router
///
/// Routes:
/// - POST /ap/inbox - Shared inbox
/// - GET /ap/:kind/:key - Stored document
/// - POST /ap/:kind/:key/inbox - Actor inbox
/// - GET /ap/:kind/:key/outbox - Outbox
/// - GET /ap/:kind/:key/followers - Followers collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/ap/inbox", post(shared_inbox))
        .route("/ap/:kind/:key", get(document))
        .route("/ap/:kind/:key/inbox", post(actor_inbox))
        .route("/ap/:kind/:key/outbox", get(outbox))
        .route("/ap/:kind/:key/followers", get(followers))
}

fn activity_json(body: Value) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        body.to_string(),
    )
        .into_response()
}

fn local_ap_id(state: &AppState, kind: &str, key: &str) -> String {
    format!("{}/ap/{}/{}", state.federation.base_url(), kind, key)
}

async fn local_actor(state: &AppState, kind: &str, key: &str) -> Result<ActorRecord, AppError> {
    let ap_id = local_ap_id(state, kind, key);
    let mut conn = state.federation.db().acquire().await?;
    store::find_actor(&mut conn, &ap_id)
        .await?
        .filter(|actor| actor.local)
        .ok_or(AppError::NotFound)
}

/// GET /ap/:kind/:key
///
/// Content-Type: application/activity+json
async fn document(
    State(state): State<AppState>,
    Path((kind, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let ap_id = local_ap_id(&state, &kind, &key);
    let mut conn = state.federation.db().acquire().await?;

    if let Some(actor) = store::find_actor(&mut conn, &ap_id).await? {
        if !actor.local {
            return Err(AppError::NotFound);
        }
        return Ok(activity_json(actor_document(&actor)));
    }

    let stored = match store::find_object(&mut conn, &ap_id).await? {
        Some(object) => Some((object.local, object.document)),
        None => match store::find_activity(&mut conn, &ap_id).await? {
            Some(activity) => Some((activity.local, activity.document)),
            None => None,
        },
    };
    if let Some((local, document)) = stored {
        if !local {
            return Err(AppError::NotFound);
        }
        let value: Value = serde_json::from_str(&document)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Stored document is invalid: {}", e)))?;
        return Ok(activity_json(value));
    }

    let collection = store::find_collection(&mut conn, &ap_id)
        .await?
        .filter(|collection| collection.local)
        .ok_or(AppError::NotFound)?;
    let items = store::collection_items(&mut conn, &collection.ap_id).await?;
    Ok(activity_json(json!({
        "@context": AS_CONTEXT,
        "type": collection.ap_type,
        "id": collection.ap_id,
        "name": collection.name,
        "audience": collection.audience,
        "totalItems": items.len(),
        "orderedItems": items,
    })))
}

/// GET /ap/:kind/:key/outbox
///
/// Only public Create and Announce activities are included, newest first.
async fn outbox(
    State(state): State<AppState>,
    Path((kind, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &kind, &key).await?;
    let mut conn = state.federation.db().acquire().await?;
    let activities = store::outbox_activities(&mut conn, &actor.ap_id, OUTBOX_PAGE_SIZE).await?;

    let mut items = Vec::with_capacity(activities.len());
    for activity in activities {
        items.push(serde_json::from_str::<Value>(&activity.document)?);
    }

    let outbox_id = actor
        .outbox
        .clone()
        .unwrap_or_else(|| format!("{}/outbox", actor.ap_id));
    Ok(activity_json(ordered_collection(&outbox_id, items.len(), Some(items))))
}

/// GET /ap/:kind/:key/followers
///
/// Follower ids are not disclosed; only the count.
async fn followers(
    State(state): State<AppState>,
    Path((kind, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &kind, &key).await?;
    let mut conn = state.federation.db().acquire().await?;
    let count = store::count_followers(&mut conn, &actor.ap_id).await?;

    Ok(activity_json(ordered_collection(
        &followers_of(&actor.ap_id),
        usize::try_from(count).unwrap_or_default(),
        None,
    )))
}

/// POST /ap/inbox
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, None, &uri, &headers, &body).await
}

/// POST /ap/:kind/:key/inbox
async fn actor_inbox(
    State(state): State<AppState>,
    Path((kind, key)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if !state.config.federation.enabled {
        return Err(AppError::Forbidden);
    }
    // Unknown targets are 404 even when the body is malformed.
    let actor = local_actor(&state, &kind, &key).await?;
    receive(&state, Some(actor.ap_id), &uri, &headers, &body).await
}

/// Accept inbound documents for deferred processing.
///
/// # Steps
/// 1. Check federation is enabled
/// 2. Validate the envelope
/// 3. Rate limit the sender's domain
/// 4. Verify the HTTP signature, when enabled
/// 5. Queue every document for the pipeline
async fn receive(
    state: &AppState,
    delivered_to: Option<String>,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    if !state.config.federation.enabled {
        return Err(AppError::Forbidden);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let documents = parse_envelope(body, content_type)?;

    let senders: Vec<String> = documents
        .iter()
        .map(|document| {
            document
                .get("actor")
                .and_then(reference_id)
                .or_else(|| document.get("id").and_then(reference_id))
                .unwrap_or_default()
        })
        .collect();

    let mut domains: Vec<String> = senders.iter().map(|sender| extract_domain(sender)).collect();
    domains.sort();
    domains.dedup();
    for domain in &domains {
        state.rate_limiter.check_and_increment(domain).await?;
    }

    if state.config.federation.verify_signatures {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());
        verify_sender(state, &senders, path, headers, body).await?;
    }

    for document in documents {
        let kind = document
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let origin = Origin {
            delivered_to: delivered_to.clone(),
            announced_by: None,
        };
        state.federation.enqueue_inbound(document, origin).await?;
        ACTIVITIES_RECEIVED.with_label_values(&[kind.as_str()]).inc();
    }

    Ok(StatusCode::ACCEPTED)
}

/// Check the request signature against the key of the sending actor.
///
/// A stored key that fails is refetched once, which covers key rotation.
async fn verify_sender(
    state: &AppState,
    senders: &[String],
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    if headers.get("signature").is_none() {
        return Err(AppError::Unauthorized);
    }
    let key_id = extract_signature_key_id(headers).map_err(|_| AppError::Unauthorized)?;
    if senders.is_empty() || !senders.iter().all(|sender| key_id_matches_actor(&key_id, sender)) {
        tracing::debug!(key_id = %key_id, "Signature keyId does not match the sending actor");
        return Err(AppError::Unauthorized);
    }
    let actor_id = senders[0].as_str();
    let now = chrono::Utc::now();

    let stored_key = {
        let mut conn = state.federation.db().acquire().await?;
        store::find_actor(&mut conn, actor_id)
            .await?
            .and_then(|actor| actor.public_key_pem)
    };
    if let Some(pem) = &stored_key {
        if verify_signature("POST", path, headers, Some(body), pem, now).is_ok() {
            return Ok(());
        }
    }

    let fetched = state
        .federation
        .fetcher()
        .fetch_actor(actor_id)
        .await
        .map_err(|e| {
            tracing::debug!(actor = %actor_id, error = %e, "Could not fetch signing actor");
            AppError::Unauthorized
        })?
        .and_then(|actor| actor.public_key_pem)
        .ok_or(AppError::Unauthorized)?;
    if stored_key.as_deref() == Some(fetched.as_str()) {
        return Err(AppError::InvalidSignature);
    }

    verify_signature("POST", path, headers, Some(body), &fetched, now).map_err(|e| {
        tracing::debug!(actor = %actor_id, error = %e, "Signature verification failed");
        AppError::InvalidSignature
    })
}
