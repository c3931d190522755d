//! Reply context resolution
//!
//! When a remote reply points at a parent we have never seen, walk its
//! `inReplyTo` links (at most `max_reply_depth` hops) until a stored object
//! is reached. The anchor must be a live post in a full-topic category.
//! Every hop found on the way is then imported root-to-leaf inside one
//! transaction: either the whole chain becomes posts or nothing does.

use std::collections::HashMap;

use crate::data::{ObjectRecord, content, store};
use crate::error::AppError;
use crate::metrics::IMPORTS_TOTAL;
use crate::notify::ContentEvent;

use super::engine::Federation;
use super::handlers::{ensure_user, object_record, remote_actor_record, sanitize_content};
use super::types::{Actor, Object};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("no stored ancestor within {0} hops")]
    DepthExceeded(usize),

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("reply chain ends without a stored ancestor")]
    NoAnchor,

    #[error("anchor {0} is not a live post")]
    AnchorUnavailable(String),

    #[error("anchor {0} is not in a full-topic category")]
    NotFullTopic(String),

    #[error("import failed: {0}")]
    Persist(#[from] AppError),
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct ResolvedChain {
    /// Stored object the chain was attached to.
    pub anchor: String,
    pub topic_id: i64,
    /// Imported object ids, root first.
    pub imported: Vec<String>,
}

/// Import the ancestors of `object` that are not stored yet.
pub async fn resolve_context(
    federation: &Federation,
    object: &Object,
) -> Result<ResolvedChain, ContextError> {
    let result = resolve(federation, object).await;

    match &result {
        Ok(chain) => {
            IMPORTS_TOTAL.with_label_values(&["context", "success"]).inc();
            tracing::info!(
                object = %object.id,
                anchor = %chain.anchor,
                imported = chain.imported.len(),
                "Reply context resolved"
            );
        }
        Err(error) => {
            IMPORTS_TOTAL.with_label_values(&["context", "failure"]).inc();
            tracing::info!(object = %object.id, %error, "Reply context not resolved");
        }
    }
    result
}

async fn resolve(federation: &Federation, object: &Object) -> Result<ResolvedChain, ContextError> {
    let max_depth = federation.config().max_reply_depth;
    let (anchor, chain) = walk(federation, object, max_depth).await?;

    let mut conn = federation.db().acquire().await?;
    let (topic_id, anchor_number) = check_anchor(&mut conn, &anchor).await?;
    drop(conn);

    if chain.is_empty() {
        return Ok(ResolvedChain {
            anchor: anchor.ap_id,
            topic_id,
            imported: Vec::new(),
        });
    }

    let authors = fetch_authors(federation, &chain).await?;

    let mut tx = federation.db().begin().await?;
    let mut events = Vec::with_capacity(chain.len());
    let mut imported = Vec::with_capacity(chain.len());
    let mut parent_number = anchor_number;

    for hop in chain.iter().rev() {
        let author_id = hop
            .attributed_to
            .as_deref()
            .ok_or_else(|| ContextError::FetchFailed(format!("{} has no author", hop.id)))?;
        if let Some(author) = authors.get(author_id) {
            store::upsert_actor(&mut tx, &remote_actor_record(author)).await?;
        }
        let mut actor = store::find_actor(&mut tx, author_id)
            .await?
            .ok_or_else(|| ContextError::FetchFailed(format!("author {} is unknown", author_id)))?;
        let user_id = ensure_user(&mut tx, &mut actor).await?;

        let (object_row, _) = store::upsert_object(&mut tx, &object_record(hop, false)).await?;
        let body = sanitize_content(hop.content.as_deref().unwrap_or_default());
        let post =
            content::create_post(&mut tx, topic_id, user_id, &body, Some(parent_number)).await?;
        store::link_object_post(&mut tx, object_row, post.id).await?;

        events.push(ContentEvent::PostCreated {
            post_id: post.id,
            topic_id,
        });
        imported.push(hop.id.clone());
        parent_number = post.post_number;
    }

    tx.commit().await.map_err(AppError::from)?;

    for event in events {
        federation.notifications().publish(event);
    }

    Ok(ResolvedChain {
        anchor: anchor.ap_id,
        topic_id,
        imported,
    })
}

/// Follow `inReplyTo` from `object` until a stored object. Returns the anchor
/// and the fetched hops, leaf first.
async fn walk(
    federation: &Federation,
    object: &Object,
    max_depth: usize,
) -> Result<(ObjectRecord, Vec<Object>), ContextError> {
    let mut next = object.in_reply_to.clone().ok_or(ContextError::NoAnchor)?;
    let mut chain: Vec<Object> = Vec::new();

    loop {
        let mut conn = federation.db().acquire().await?;
        if let Some(stored) = store::find_object(&mut conn, &next).await? {
            return Ok((stored, chain));
        }
        drop(conn);

        if chain.len() >= max_depth {
            return Err(ContextError::DepthExceeded(max_depth));
        }

        let hop = match federation.fetcher().fetch_object(&next).await {
            Ok(Some(hop)) => hop,
            Ok(None) => return Err(ContextError::FetchFailed(format!("{} not found", next))),
            Err(error) => return Err(ContextError::FetchFailed(format!("{}: {}", next, error))),
        };
        if !hop.kind.is_post_like() {
            return Err(ContextError::FetchFailed(format!(
                "{} is a {}",
                hop.id, hop.kind
            )));
        }
        tracing::debug!(hop = %hop.id, depth = chain.len() + 1, "Fetched reply ancestor");

        next = hop.in_reply_to.clone().ok_or(ContextError::NoAnchor)?;
        chain.push(hop);
    }
}

/// Topic and post number of a usable anchor.
async fn check_anchor(
    conn: &mut sqlx::SqliteConnection,
    anchor: &ObjectRecord,
) -> Result<(i64, i64), ContextError> {
    let unavailable = || ContextError::AnchorUnavailable(anchor.ap_id.clone());
    if anchor.is_tombstone() {
        return Err(unavailable());
    }

    let post_id = anchor.post_id.ok_or_else(unavailable)?;
    let post = content::find_post(conn, post_id)
        .await?
        .filter(|post| !post.is_deleted())
        .ok_or_else(unavailable)?;

    let full_topic = match content::find_topic(conn, post.topic_id)
        .await?
        .and_then(|topic| topic.category_id)
    {
        Some(category_id) => content::find_category(conn, category_id)
            .await?
            .is_some_and(|category| category.full_topic),
        None => false,
    };
    if !full_topic {
        return Err(ContextError::NotFullTopic(anchor.ap_id.clone()));
    }

    Ok((post.topic_id, post.post_number))
}

/// Dereference every author of the chain that is not stored yet.
async fn fetch_authors(
    federation: &Federation,
    chain: &[Object],
) -> Result<HashMap<String, Actor>, ContextError> {
    let mut authors = HashMap::new();

    for hop in chain {
        let Some(author_id) = hop.attributed_to.as_deref() else {
            return Err(ContextError::FetchFailed(format!("{} has no author", hop.id)));
        };
        if authors.contains_key(author_id) {
            continue;
        }

        let mut conn = federation.db().acquire().await?;
        if store::find_actor(&mut conn, author_id).await?.is_some() {
            continue;
        }
        drop(conn);

        match federation.fetcher().fetch_actor(author_id).await {
            Ok(Some(actor)) => {
                authors.insert(author_id.to_string(), actor);
            }
            Ok(None) => {
                return Err(ContextError::FetchFailed(format!("{} not found", author_id)));
            }
            Err(error) => {
                return Err(ContextError::FetchFailed(format!("{}: {}", author_id, error)));
            }
        }
    }

    Ok(authors)
}
