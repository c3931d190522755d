//! Publishing local content
//!
//! Categories federate through a local `Group` actor; authors get a local
//! `Person` actor the first time they post in one. A new post becomes a
//! Note and a `Create` by the author, which the Group wraps in an
//! `Announce` and delivers to its followers. Edits and deletions made while
//! the original delivery is still pending replace it instead of adding a
//! second message.

use chrono::Utc;
use serde_json::Value;

use crate::data::{
    ActorRecord, MODEL_CATEGORY, MODEL_USER, NewActor, NewCollection, ObjectRecord, content, store,
};
use crate::error::AppError;

use super::delivery::builder::{self, NoteFields};
use super::engine::Federation;
use super::handlers::{activity_record, group_for_topic, object_record, remote_actor_record};
use super::signature::generate_keypair;
use super::types::{Activity, ApType, Object};
use super::webfinger::resolve_webfinger;

// =============================================================================
// Local actors
// =============================================================================

async fn create_local_actor(
    federation: &Federation,
    ap_type: &str,
    username: &str,
    name: Option<&str>,
    model_type: &str,
    model_id: i64,
) -> Result<ActorRecord, AppError> {
    let bits = federation.actor_key_bits();
    let (private_key_pem, public_key_pem) = tokio::task::spawn_blocking(move || generate_keypair(bits))
        .await
        .map_err(|e| AppError::Internal(e.into()))??;

    let ap_id = federation.mint_id(ap_type);
    let actor = NewActor {
        ap_id: ap_id.clone(),
        ap_type: ap_type.to_string(),
        username: Some(username.to_string()),
        name: name.map(str::to_string),
        domain: federation.domain().to_string(),
        inbox: Some(format!("{}/inbox", ap_id)),
        outbox: Some(format!("{}/outbox", ap_id)),
        public_key_pem: Some(public_key_pem),
        private_key_pem: Some(private_key_pem),
        local: true,
        model_type: Some(model_type.to_string()),
        model_id: Some(model_id),
    };

    let mut conn = federation.db().acquire().await?;
    store::upsert_actor(&mut conn, &actor).await?;
    let record = store::find_actor(&mut conn, &ap_id)
        .await?
        .ok_or(AppError::NotFound)?;

    tracing::info!(actor = %ap_id, kind = ap_type, "Local actor created");
    Ok(record)
}

/// Federate a category through a local Group. Returns the existing Group
/// when the category is already federated.
pub async fn enable_category(federation: &Federation, category_id: i64) -> Result<ActorRecord, AppError> {
    let mut conn = federation.db().acquire().await?;
    if let Some(group) = store::find_actor_by_model(&mut conn, MODEL_CATEGORY, category_id)
        .await?
        .filter(|actor| actor.local)
    {
        return Ok(group);
    }
    let category = content::find_category(&mut conn, category_id)
        .await?
        .ok_or(AppError::NotFound)?;
    drop(conn);

    create_local_actor(
        federation,
        "Group",
        &category.slug,
        Some(&category.name),
        MODEL_CATEGORY,
        category.id,
    )
    .await
}

/// Local Person of a host user, created on first use.
pub async fn ensure_person(federation: &Federation, user_id: i64) -> Result<ActorRecord, AppError> {
    let mut conn = federation.db().acquire().await?;
    if let Some(person) = store::find_actor_by_model(&mut conn, MODEL_USER, user_id)
        .await?
        .filter(|actor| actor.local)
    {
        return Ok(person);
    }
    let user = content::find_user(&mut conn, user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    drop(conn);

    if user.staged {
        return Err(AppError::Validation(format!(
            "user {} mirrors a remote actor",
            user.username
        )));
    }

    create_local_actor(
        federation,
        "Person",
        &user.username,
        user.name.as_deref(),
        MODEL_USER,
        user.id,
    )
    .await
}

// =============================================================================
// Posts
// =============================================================================

fn store_error(error: impl std::fmt::Display) -> AppError {
    AppError::Federation(format!("stored document is invalid: {}", error))
}

fn parse_activity(document: &Value) -> Result<Activity, AppError> {
    let kind = super::types::type_tag(document)
        .and_then(ApType::from_tag)
        .ok_or_else(|| store_error("missing type"))?;
    Activity::parse(kind, document).map_err(store_error)
}

/// Publish a newly created post. Returns the Note id, or `None` when the
/// post's category is not federated or its replies are not.
pub async fn publish_post_created(federation: &Federation, post_id: i64) -> Result<Option<String>, AppError> {
    let mut conn = federation.db().acquire().await?;
    let post = content::find_post(&mut conn, post_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if let Some(existing) = store::find_object_by_post(&mut conn, post_id).await? {
        return Ok(Some(existing.ap_id));
    }
    let topic = content::find_topic(&mut conn, post.topic_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let Some(group) = group_for_topic(&mut conn, topic.id).await? else {
        return Ok(None);
    };
    let Some(category) = group.category_id() else {
        return Ok(None);
    };
    let category = content::find_category(&mut conn, category)
        .await?
        .ok_or(AppError::NotFound)?;
    if !post.is_first_post() && !category.full_topic {
        return Ok(None);
    }

    let parent = match post.reply_to_post_number {
        Some(number) => match content::find_post_by_number(&mut conn, topic.id, number).await? {
            Some(parent) => store::find_object_by_post(&mut conn, parent.id)
                .await?
                .map(|object| object.ap_id),
            None => None,
        },
        None => None,
    };
    let parent = match parent {
        Some(parent) => Some(parent),
        None if !post.is_first_post() => {
            // Replies without an explicit target answer the first post.
            match content::find_post_by_number(&mut conn, topic.id, 1).await? {
                Some(first) => store::find_object_by_post(&mut conn, first.id)
                    .await?
                    .map(|object| object.ap_id),
                None => None,
            }
        }
        None => None,
    };
    let existing_collection = store::find_collection_by_topic(&mut conn, topic.id).await?;
    drop(conn);

    let person = ensure_person(federation, post.user_id).await?;

    let new_collection = (category.full_topic && existing_collection.is_none())
        .then(|| federation.mint_id("OrderedCollection"));
    let context = existing_collection
        .map(|collection| collection.ap_id)
        .or_else(|| new_collection.clone());

    let (to, cc) = builder::public_audience(&group.ap_id);
    let note_id = federation.mint_id("Note");
    let published = post.created_at.to_rfc3339();
    let note = builder::note(
        &note_id,
        &person.ap_id,
        &post.content,
        &published,
        NoteFields {
            name: post.is_first_post().then_some(topic.title.as_str()),
            in_reply_to: parent.as_deref(),
            context: context.as_deref(),
            audience: Some(&group.ap_id),
            updated: None,
        },
        &to,
        &cc,
    );
    let create_id = federation.mint_id("Create");
    let create = builder::create(&create_id, &person.ap_id, note.clone(), &to, &cc);
    let announce_id = federation.mint_id("Announce");
    let announce = builder::announce(&announce_id, &group.ap_id, create.clone(), &to, &cc);

    let object = Object::parse(ApType::Note, &note).map_err(store_error)?;
    let create_activity = parse_activity(&create)?;
    let announce_activity = parse_activity(&announce)?;

    let mut tx = federation.db().begin().await?;
    if let Some(collection) = &new_collection {
        store::upsert_collection(
            &mut tx,
            &NewCollection {
                ap_id: collection.clone(),
                ap_type: "OrderedCollection".to_string(),
                name: Some(topic.title.clone()),
                audience: Some(group.ap_id.clone()),
                local: true,
                topic_id: Some(topic.id),
            },
        )
        .await?;
    }
    let (object_row, _) = store::upsert_object(&mut tx, &object_record(&object, true)).await?;
    store::link_object_post(&mut tx, object_row, post.id).await?;
    store::upsert_activity(&mut tx, &activity_record(&create_activity, Some("Note".into()), true))
        .await?;
    store::upsert_activity(
        &mut tx,
        &activity_record(&announce_activity, Some("Create".into()), true),
    )
    .await?;
    tx.commit().await?;

    let recipients = federation
        .delivery()
        .schedule(&announce, &note_id, &group.ap_id, None)
        .await?;
    tracing::info!(post_id, note = %note_id, recipients, "Post published");
    Ok(Some(note_id))
}

/// Federated Note, author and Group of a published post.
async fn published(
    federation: &Federation,
    post_id: i64,
) -> Result<Option<(ObjectRecord, ActorRecord)>, AppError> {
    let mut conn = federation.db().acquire().await?;
    let Some(object) = store::find_object_by_post(&mut conn, post_id)
        .await?
        .filter(|object| object.local && !object.is_tombstone())
    else {
        return Ok(None);
    };
    let Some(post) = content::find_post(&mut conn, post_id).await? else {
        return Ok(None);
    };
    let group = group_for_topic(&mut conn, post.topic_id).await?;
    Ok(group.map(|group| (object, group)))
}

/// Publish an edit. A recipient whose Create is still pending gets the new
/// state inside the original Create; everyone else gets an Update.
pub async fn publish_post_edited(federation: &Federation, post_id: i64) -> Result<bool, AppError> {
    let Some((object, group)) = published(federation, post_id).await? else {
        return Ok(false);
    };
    let author = object
        .attributed_to
        .clone()
        .ok_or_else(|| store_error("note has no author"))?;

    let mut conn = federation.db().acquire().await?;
    let post = content::find_post(&mut conn, post_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let create = store::find_activity_by(&mut conn, "Create", &author, &object.ap_id)
        .await?
        .ok_or_else(|| store_error("note has no Create"))?;
    let original_announce = store::find_activity_by(&mut conn, "Announce", &group.ap_id, &create.ap_id)
        .await?
        .ok_or_else(|| store_error("Create was never announced"))?;
    let already_updated = store::find_activity_by(&mut conn, "Update", &author, &object.ap_id)
        .await?
        .is_some();
    drop(conn);

    let mut note: Value = serde_json::from_str(&object.document)?;
    note["content"] = Value::String(post.content.clone());
    note["updated"] = Value::String(Utc::now().to_rfc3339());
    let updated_object = Object::parse(ApType::Note, &note).map_err(store_error)?;

    let (to, cc) = builder::public_audience(&group.ap_id);
    let replaced_create = builder::announce(
        &original_announce.ap_id,
        &group.ap_id,
        builder::create(&create.ap_id, &author, note.clone(), &to, &cc),
        &to,
        &cc,
    );
    let update = builder::update(&federation.mint_id("Update"), &author, note, &to, &cc);
    let update_announce = builder::announce(
        &federation.mint_id("Announce"),
        &group.ap_id,
        update.clone(),
        &to,
        &cc,
    );

    let delivery = federation.delivery();
    let recipients = delivery.recipients(&group.ap_id, None).await?;
    let mut plan = Vec::with_capacity(recipients.len());
    for to_actor in &recipients {
        let pending_create =
            !already_updated && delivery.has_pending(&object.ap_id, &group.ap_id, to_actor).await;
        plan.push((to_actor, pending_create));
    }
    let replaced = plan.iter().filter(|(_, pending)| *pending).count();
    let sends_update = replaced < plan.len();

    let mut tx = federation.db().begin().await?;
    store::upsert_object(&mut tx, &object_record(&updated_object, true)).await?;
    if sends_update {
        store::upsert_activity(
            &mut tx,
            &activity_record(&parse_activity(&update)?, Some("Note".into()), true),
        )
        .await?;
        store::upsert_activity(
            &mut tx,
            &activity_record(&parse_activity(&update_announce)?, Some("Update".into()), true),
        )
        .await?;
    }
    tx.commit().await?;

    for (to_actor, pending_create) in plan {
        let activity = if pending_create {
            &replaced_create
        } else {
            &update_announce
        };
        delivery
            .schedule_one(activity, &object.ap_id, &group.ap_id, to_actor)
            .await?;
    }

    tracing::info!(
        post_id,
        note = %object.ap_id,
        recipients = recipients.len(),
        replaced,
        "Post edit published"
    );
    Ok(true)
}

/// Publish a deletion. Recipients that never received the Create only lose
/// the pending delivery; everyone else gets a Delete.
pub async fn publish_post_deleted(federation: &Federation, post_id: i64) -> Result<bool, AppError> {
    let Some((object, group)) = published(federation, post_id).await? else {
        return Ok(false);
    };
    let author = object
        .attributed_to
        .clone()
        .ok_or_else(|| store_error("note has no author"))?;

    let mut conn = federation.db().acquire().await?;
    let already_updated = store::find_activity_by(&mut conn, "Update", &author, &object.ap_id)
        .await?
        .is_some();
    drop(conn);

    let (to, cc) = builder::public_audience(&group.ap_id);
    let delete = builder::delete(&federation.mint_id("Delete"), &author, &object.ap_id, &to, &cc);
    let announce = builder::announce(
        &federation.mint_id("Announce"),
        &group.ap_id,
        delete.clone(),
        &to,
        &cc,
    );

    let mut tx = federation.db().begin().await?;
    store::tombstone_object(&mut tx, &object.ap_id).await?;
    store::upsert_activity(&mut tx, &activity_record(&parse_activity(&delete)?, Some("Note".into()), true))
        .await?;
    store::upsert_activity(
        &mut tx,
        &activity_record(&parse_activity(&announce)?, Some("Delete".into()), true),
    )
    .await?;
    tx.commit().await?;

    let delivery = federation.delivery();
    let recipients = delivery.recipients(&group.ap_id, None).await?;
    let mut withdrawn = 0;
    for to_actor in &recipients {
        let cancelled = delivery
            .cancel_pending(&object.ap_id, &group.ap_id, to_actor)
            .await;
        if cancelled && !already_updated {
            withdrawn += 1;
            continue;
        }
        delivery
            .schedule_one(&announce, &object.ap_id, &group.ap_id, to_actor)
            .await?;
    }

    tracing::info!(
        post_id,
        note = %object.ap_id,
        recipients = recipients.len(),
        withdrawn,
        "Post deletion published"
    );
    Ok(true)
}

// =============================================================================
// Following remote actors
// =============================================================================

async fn local_group(federation: &Federation, group_id: &str) -> Result<ActorRecord, AppError> {
    let mut conn = federation.db().acquire().await?;
    store::find_actor(&mut conn, group_id)
        .await?
        .filter(|actor| actor.local && actor.ap_type == "Group")
        .ok_or(AppError::NotFound)
}

/// Ask a remote actor, given by id or `user@domain`, to be followed by a
/// local Group. Returns the Follow id.
pub async fn follow_remote(federation: &Federation, group_id: &str, target: &str) -> Result<String, AppError> {
    let group = local_group(federation, group_id).await?;

    let target_id = if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        resolve_webfinger(federation.fetcher(), target).await?.actor_uri
    };
    if federation.is_local_id(&target_id) {
        return Err(AppError::Validation(format!("{} is a local actor", target_id)));
    }

    let mut conn = federation.db().acquire().await?;
    let stored = store::find_actor(&mut conn, &target_id).await?;
    drop(conn);
    let target_type = match stored {
        Some(actor) => actor.ap_type,
        None => {
            let actor = federation
                .fetcher()
                .fetch_actor(&target_id)
                .await?
                .ok_or(AppError::NotFound)?;
            let mut conn = federation.db().acquire().await?;
            store::upsert_actor(&mut conn, &remote_actor_record(&actor)).await?;
            actor.kind.as_str().to_string()
        }
    };

    let follow_id = federation.mint_id("Follow");
    let follow = builder::follow(&follow_id, &group.ap_id, &target_id);
    let mut conn = federation.db().acquire().await?;
    store::upsert_activity(
        &mut conn,
        &activity_record(&parse_activity(&follow)?, Some(target_type), true),
    )
    .await?;
    drop(conn);

    federation
        .delivery()
        .schedule(&follow, &follow_id, &group.ap_id, Some(vec![target_id.clone()]))
        .await?;
    tracing::info!(group = %group.ap_id, target = %target_id, "Follow sent");
    Ok(follow_id)
}

/// Withdraw a Group's Follow. Returns false when there was none.
pub async fn unfollow_remote(federation: &Federation, group_id: &str, target_id: &str) -> Result<bool, AppError> {
    let group = local_group(federation, group_id).await?;

    let mut conn = federation.db().acquire().await?;
    let Some(follow) = store::find_activity_by(&mut conn, "Follow", &group.ap_id, target_id).await?
    else {
        return Ok(false);
    };
    let follow_document: Value = serde_json::from_str(&follow.document)?;

    let undo_id = federation.mint_id("Undo");
    let undo = builder::undo(&undo_id, &group.ap_id, follow_document);
    store::upsert_activity(
        &mut conn,
        &activity_record(&parse_activity(&undo)?, Some("Follow".into()), true),
    )
    .await?;
    store::remove_follow(&mut conn, &group.ap_id, target_id).await?;
    drop(conn);

    federation
        .delivery()
        .schedule(&undo, &follow.ap_id, &group.ap_id, Some(vec![target_id.to_string()]))
        .await?;
    tracing::info!(group = %group.ap_id, target = %target_id, "Follow withdrawn");
    Ok(true)
}
