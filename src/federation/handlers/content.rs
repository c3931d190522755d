//! Create, Update and Delete of Notes and Articles.

use crate::data::{NewCollection, content, store};
use crate::error::StageError;
use crate::federation::context;
use crate::federation::engine::Federation;
use crate::federation::pipeline::{ActivityRun, Resolved, read_error, run_kind_stage, stage_conn};
use crate::federation::registry::Stage;
use crate::federation::types::{self, Activity, ApEntity, Object};
use crate::notify::ContentEvent;

use super::common::{
    ensure_user, group_for_topic, object_record, resolve_stored_object, sanitize_content, topic_title,
};

/// The object carried by an activity, embedded or dereferenced.
async fn carried_object(federation: &Federation, activity: &Activity) -> Result<Object, StageError> {
    let reference = activity
        .object
        .as_ref()
        .ok_or_else(|| StageError::rejected(format!("{} has no object", activity.id)))?;

    let entity = match &reference.embedded {
        Some(document) => {
            types::build_entity(document).map_err(|e| StageError::rejected(e.to_string()))?
        }
        None => federation
            .fetcher()
            .fetch_entity(&reference.id)
            .await
            .map_err(|e| {
                StageError::rejected(format!("object {} could not be fetched: {}", reference.id, e))
            })?
            .ok_or_else(|| {
                StageError::rejected(format!("object {} could not be fetched", reference.id))
            })?,
    };

    match entity {
        ApEntity::Object(object) if object.kind.is_post_like() => Ok(object),
        other => Err(StageError::rejected(format!(
            "{} is a {}, not a Note or Article",
            other.id(),
            other.type_name()
        ))),
    }
}

// =============================================================================
// Create
// =============================================================================

/// resolve: a stored object, or the carried one plus its stored parent.
pub(super) async fn resolve_create(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let Some(object_id) = run.activity.object_id().map(str::to_string) else {
        return Err(StageError::rejected(format!("{} has no object", run.activity.id)));
    };

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    if let Some(existing) = store::find_object(&mut conn, &object_id)
        .await
        .map_err(read_error)?
    {
        run.cache.object = Some(Resolved::Object(existing));
        return Ok(());
    }
    drop(conn);

    let object = carried_object(federation, &run.activity).await?;
    if let Some(parent_id) = &object.in_reply_to {
        let mut conn = federation.db().acquire().await.map_err(read_error)?;
        run.cache.parent = store::find_object(&mut conn, parent_id)
            .await
            .map_err(read_error)?;
    }
    run.cache.new_object = Some(object);
    Ok(())
}

/// validate: a new post-like object, a reply to a live post or a new topic
/// for a local Group that follows the sender.
pub(super) async fn validate_create(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    if let Some(existing) = &run.cache.object {
        return Err(StageError::rejected(format!(
            "object {} is already stored",
            existing.ap_id()
        )));
    }
    let object = run
        .cache
        .new_object
        .clone()
        .ok_or_else(|| StageError::rejected("Create carries no object"))?;

    if object
        .attributed_to
        .as_deref()
        .is_some_and(|owner| owner != run.activity.actor)
    {
        return Err(StageError::rejected(format!(
            "object {} is not attributed to {}",
            object.id, run.activity.actor
        )));
    }

    match &object.in_reply_to {
        Some(parent_id) => validate_reply(federation, run, &object, parent_id).await,
        None => validate_new_topic(federation, run, &object).await,
    }
}

async fn validate_reply(
    federation: &Federation,
    run: &mut ActivityRun,
    object: &Object,
    parent_id: &str,
) -> Result<(), StageError> {
    if run.cache.parent.is_none() {
        // Unknown parent: import the chain up to a local anchor first.
        context::resolve_context(federation, object)
            .await
            .map_err(|e| StageError::rejected(format!("reply context of {}: {}", object.id, e)))?;

        let mut conn = federation.db().acquire().await.map_err(read_error)?;
        run.cache.parent = store::find_object(&mut conn, parent_id)
            .await
            .map_err(read_error)?;
    }

    let parent = run
        .cache
        .parent
        .clone()
        .ok_or_else(|| StageError::rejected(format!("reply parent {} is unknown", parent_id)))?;
    let deleted = || StageError::rejected(format!("reply targets deleted post {}", parent_id));
    if parent.is_tombstone() {
        return Err(deleted());
    }

    let post_id = parent
        .post_id
        .ok_or_else(|| StageError::rejected(format!("reply parent {} has no post", parent_id)))?;

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    let post = content::find_post(&mut conn, post_id)
        .await
        .map_err(read_error)?
        .ok_or_else(deleted)?;
    if post.is_deleted() {
        return Err(deleted());
    }

    let group = group_for_topic(&mut conn, post.topic_id)
        .await
        .map_err(read_error)?
        .ok_or_else(|| {
            StageError::rejected(format!("reply parent {} is not in a federated topic", parent_id))
        })?;
    run.cache.target_group = Some(group);
    Ok(())
}

async fn validate_new_topic(
    federation: &Federation,
    run: &mut ActivityRun,
    object: &Object,
) -> Result<(), StageError> {
    let activity = &run.activity;
    let mut candidates: Vec<&str> = Vec::new();
    candidates.extend(run.origin.delivered_to.as_deref());
    candidates.extend(activity.to.iter().map(String::as_str));
    candidates.extend(activity.cc.iter().map(String::as_str));
    candidates.extend(activity.audience.as_deref());
    candidates.extend(object.audience.as_deref());

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    let mut target = None;
    for candidate in candidates {
        let group_id = candidate.strip_suffix("/followers").unwrap_or(candidate);
        if !federation.is_local_id(group_id) {
            continue;
        }

        let Some(group) = store::find_actor(&mut conn, group_id)
            .await
            .map_err(read_error)?
            .filter(|actor| actor.local && actor.ap_type == "Group" && actor.category_id().is_some())
        else {
            continue;
        };

        let mut follows = store::is_following(&mut conn, &group.ap_id, &activity.actor)
            .await
            .map_err(read_error)?;
        if !follows {
            if let Some(announcer) = &run.origin.announced_by {
                follows = store::is_following(&mut conn, &group.ap_id, announcer)
                    .await
                    .map_err(read_error)?;
            }
        }

        if follows {
            target = Some(group);
            break;
        }
    }

    match target {
        Some(group) => {
            run.cache.target_group = Some(group);
            Ok(())
        }
        None => Err(StageError::rejected(format!(
            "{} is not addressed to a local Group that follows {}",
            activity.id, activity.actor
        ))),
    }
}

/// store: hand the object to the store handlers of its own type.
pub(super) async fn store_created_object(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let kind = run
        .cache
        .new_object
        .as_ref()
        .map(|object| object.kind)
        .ok_or_else(|| StageError::store("Create carries no object"))?;
    run_kind_stage(federation, run, kind, Stage::Store).await
}

/// store (Note, Article): upsert the carried object.
pub(super) async fn store_post_object(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let record = {
        let object = run
            .cache
            .new_object
            .as_ref()
            .ok_or_else(|| StageError::store("no object to store"))?;
        let conn = stage_conn(&mut run.tx)?;
        store::upsert_object(conn, &object_record(object, false))
            .await
            .map_err(StageError::store)?;
        store::find_object(conn, &object.id)
            .await
            .map_err(StageError::store)?
            .ok_or_else(|| StageError::store(format!("object {} vanished", object.id)))?
    };
    run.cache.object = Some(Resolved::Object(record));
    Ok(())
}

/// perform: create the topic or reply post for the stored object.
pub(super) async fn perform_create(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let object = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_object)
        .cloned()
        .ok_or_else(|| StageError::perform("Create object is not stored"))?;
    let group = run
        .cache
        .target_group
        .clone()
        .ok_or_else(|| StageError::perform("Create has no target Group"))?;
    let parent = run.cache.parent.clone();

    let conn = stage_conn(&mut run.tx)?;
    let actor = run
        .cache
        .actor
        .as_mut()
        .ok_or_else(|| StageError::perform("sender is not stored"))?;
    let user_id = ensure_user(conn, actor).await.map_err(StageError::perform)?;
    let body = sanitize_content(object.content.as_deref().unwrap_or_default());

    let post = match parent.and_then(|parent| parent.post_id) {
        Some(parent_post_id) => {
            let parent_post = content::find_post(conn, parent_post_id)
                .await
                .map_err(StageError::perform)?
                .filter(|post| !post.is_deleted())
                .ok_or_else(|| StageError::perform(format!("post {} is gone", parent_post_id)))?;
            content::create_post(
                conn,
                parent_post.topic_id,
                user_id,
                &body,
                Some(parent_post.post_number),
            )
            .await
            .map_err(StageError::perform)?
        }
        None => {
            let category_id = group
                .category_id()
                .ok_or_else(|| StageError::perform(format!("{} has no category", group.ap_id)))?;
            let category = content::find_category(conn, category_id)
                .await
                .map_err(StageError::perform)?
                .ok_or_else(|| StageError::perform(format!("category {} is gone", category_id)))?;

            let title = topic_title(object.name.as_deref(), object.content.as_deref());
            let topic = content::create_topic(conn, Some(category.id), user_id, &title)
                .await
                .map_err(StageError::perform)?;

            if category.full_topic {
                let collection_id = object
                    .context
                    .clone()
                    .unwrap_or_else(|| federation.mint_id("OrderedCollection"));
                store::upsert_collection(
                    conn,
                    &NewCollection {
                        local: federation.is_local_id(&collection_id),
                        ap_id: collection_id,
                        ap_type: "OrderedCollection".to_string(),
                        name: Some(title),
                        audience: Some(group.ap_id.clone()),
                        topic_id: Some(topic.id),
                    },
                )
                .await
                .map_err(StageError::perform)?;
            }

            content::create_post(conn, topic.id, user_id, &body, None)
                .await
                .map_err(StageError::perform)?
        }
    };

    store::link_object_post(conn, object.id, post.id)
        .await
        .map_err(StageError::perform)?;

    run.cache.post_id = Some(post.id);
    run.cache.events.push(ContentEvent::PostCreated {
        post_id: post.id,
        topic_id: post.topic_id,
    });
    Ok(())
}

// =============================================================================
// Update
// =============================================================================

/// resolve: the stored object and its new state.
pub(super) async fn resolve_update(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    resolve_stored_object(federation, run).await?;
    if run.cache.object.is_some() {
        run.cache.new_object = Some(carried_object(federation, &run.activity).await?);
    }
    Ok(())
}

/// validate: only the author may update a live object.
pub(super) async fn validate_update(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let stored = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_object)
        .ok_or_else(|| StageError::rejected(format!("{} updates an unknown object", run.activity.id)))?;
    if stored.is_tombstone() {
        return Err(StageError::rejected(format!("object {} was deleted", stored.ap_id)));
    }
    if stored.attributed_to.as_deref() != Some(run.activity.actor.as_str()) {
        return Err(StageError::rejected(format!(
            "{} does not own {}",
            run.activity.actor, stored.ap_id
        )));
    }

    let updated = run
        .cache
        .new_object
        .as_ref()
        .ok_or_else(|| StageError::rejected("Update carries no object"))?;
    if updated.id != stored.ap_id || updated.kind.as_str() != stored.ap_type {
        return Err(StageError::rejected(format!(
            "Update object {} does not match stored {}",
            updated.id, stored.ap_id
        )));
    }
    Ok(())
}

/// store: upsert the new object state.
pub(super) async fn store_updated_object(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    store_post_object(federation, run).await
}

/// perform: replace the post content.
pub(super) async fn perform_update(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let object = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_object)
        .cloned()
        .ok_or_else(|| StageError::perform("Update object is not stored"))?;
    let Some(post_id) = object.post_id else {
        return Ok(());
    };

    let conn = stage_conn(&mut run.tx)?;
    let body = sanitize_content(object.content.as_deref().unwrap_or_default());
    if !content::update_post_content(conn, post_id, &body)
        .await
        .map_err(StageError::perform)?
    {
        return Err(StageError::perform(format!("post {} is gone", post_id)));
    }

    run.cache.post_id = Some(post_id);
    run.cache.events.push(ContentEvent::PostUpdated { post_id });
    Ok(())
}

// =============================================================================
// Delete
// =============================================================================

/// validate: only the author may delete a live object.
pub(super) async fn validate_delete(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let stored = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_object)
        .ok_or_else(|| StageError::rejected(format!("{} deletes an unknown object", run.activity.id)))?;
    if stored.is_tombstone() {
        return Err(StageError::rejected(format!("object {} is already deleted", stored.ap_id)));
    }
    if stored.attributed_to.as_deref() != Some(run.activity.actor.as_str()) {
        return Err(StageError::rejected(format!(
            "{} does not own {}",
            run.activity.actor, stored.ap_id
        )));
    }
    Ok(())
}

/// perform: tombstone the object and trash its post.
pub(super) async fn perform_delete(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let object = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_object)
        .cloned()
        .ok_or_else(|| StageError::perform("Delete object is not stored"))?;

    let conn = stage_conn(&mut run.tx)?;
    store::tombstone_object(conn, &object.ap_id)
        .await
        .map_err(StageError::perform)?;

    if let Some(post_id) = object.post_id {
        if !content::trash_post(conn, post_id)
            .await
            .map_err(StageError::perform)?
        {
            return Err(StageError::perform(format!("post {} is already gone", post_id)));
        }
        run.cache.post_id = Some(post_id);
        run.cache.events.push(ContentEvent::PostDeleted { post_id });
    }
    Ok(())
}
