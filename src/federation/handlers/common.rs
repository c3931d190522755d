//! Handlers and helpers shared by every activity type.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::data::{
    ActorRecord, MODEL_CATEGORY, MODEL_USER, NewActivity, NewActor, NewObject, ObjectRecord,
    content, store,
};
use crate::error::{AppError, StageError, ValidateError};
use crate::federation::engine::Federation;
use crate::federation::pipeline::{ActivityRun, Resolved, read_error, stage_conn};
use crate::federation::rate_limit::extract_domain;
use crate::federation::types::{Activity, Actor, Object};

const TITLE_MAX_CHARS: usize = 80;

// =============================================================================
// Record conversion
// =============================================================================

pub(crate) fn remote_actor_record(actor: &Actor) -> NewActor {
    NewActor {
        ap_id: actor.id.clone(),
        ap_type: actor.kind.as_str().to_string(),
        username: actor.preferred_username.clone(),
        name: actor.name.clone(),
        domain: extract_domain(&actor.id),
        inbox: actor.inbox.clone(),
        outbox: actor.outbox.clone(),
        public_key_pem: actor.public_key_pem.clone(),
        ..Default::default()
    }
}

pub(crate) fn object_record(object: &Object, local: bool) -> NewObject {
    NewObject {
        ap_id: object.id.clone(),
        ap_type: object.kind.as_str().to_string(),
        content: object.content.clone(),
        name: object.name.clone(),
        attributed_to: object.attributed_to.clone(),
        in_reply_to: object.in_reply_to.clone(),
        context: object.context.clone(),
        audience: object.audience.clone(),
        published_at: object.published,
        local,
        document: object.document.to_string(),
    }
}

pub(crate) fn activity_record(
    activity: &Activity,
    object_type: Option<String>,
    local: bool,
) -> NewActivity {
    NewActivity {
        ap_id: activity.id.clone(),
        ap_type: activity.kind.as_str().to_string(),
        actor: activity.actor.clone(),
        object: activity.object_id().map(str::to_string),
        object_type,
        target: activity.target.clone(),
        public: activity.is_public(),
        published_at: activity.published.or_else(|| Some(Utc::now())),
        local,
        document: activity.document.to_string(),
    }
}

// =============================================================================
// Host content helpers
// =============================================================================

/// Remote HTML reduced to the tags the forum renders.
pub(crate) fn sanitize_content(html: &str) -> String {
    ammonia::clean(html)
}

/// Topic title from the object's name, or the start of its text.
pub(crate) fn topic_title(name: Option<&str>, html: Option<&str>) -> String {
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    let text = ammonia::Builder::empty()
        .clean(html.unwrap_or_default())
        .to_string();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return "Untitled".to_string();
    }

    match text.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text,
    }
}

/// Host user linked to `actor`, created as a staged user when missing.
pub(crate) async fn ensure_user(
    conn: &mut SqliteConnection,
    actor: &mut ActorRecord,
) -> Result<i64, AppError> {
    if let Some(user_id) = actor.user_id() {
        return Ok(user_id);
    }

    let username = actor.username.clone().unwrap_or_else(|| "user".to_string());
    let user = content::create_user(conn, &username, actor.name.as_deref(), !actor.local).await?;
    store::link_actor_model(conn, actor.id, MODEL_USER, user.id).await?;

    actor.model_type = Some(MODEL_USER.to_string());
    actor.model_id = Some(user.id);
    tracing::debug!(actor = %actor.ap_id, user_id = user.id, "Linked actor to user");
    Ok(user.id)
}

/// Local Group federating the category of the topic `object` is posted in.
pub(crate) async fn group_for_object(
    conn: &mut SqliteConnection,
    object: &ObjectRecord,
) -> Result<Option<ActorRecord>, AppError> {
    let Some(post_id) = object.post_id else {
        return Ok(None);
    };
    let Some(post) = content::find_post(conn, post_id).await? else {
        return Ok(None);
    };
    group_for_topic(conn, post.topic_id).await
}

pub(crate) async fn group_for_topic(
    conn: &mut SqliteConnection,
    topic_id: i64,
) -> Result<Option<ActorRecord>, AppError> {
    let Some(category_id) = content::find_topic(conn, topic_id)
        .await?
        .and_then(|topic| topic.category_id)
    else {
        return Ok(None);
    };
    Ok(store::find_actor_by_model(conn, MODEL_CATEGORY, category_id)
        .await?
        .filter(|actor| actor.local))
}

// =============================================================================
// Shared stage handlers
// =============================================================================

/// resolve: the sender, stored or dereferenced.
pub(super) async fn resolve_sender(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let actor_id = run.activity.actor.clone();
    if federation.is_local_id(&actor_id) {
        return Err(StageError::rejected(format!(
            "{} claims to be sent by local actor {}",
            run.activity.id, actor_id
        )));
    }

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    if let Some(actor) = store::find_actor(&mut conn, &actor_id)
        .await
        .map_err(read_error)?
    {
        run.cache.actor = Some(actor);
        return Ok(());
    }
    drop(conn);

    match federation.fetcher().fetch_actor(&actor_id).await {
        Ok(Some(actor)) => {
            run.cache.remote_actor = Some(actor);
            Ok(())
        }
        Ok(None) => Err(StageError::rejected(format!(
            "sender {} could not be dereferenced",
            actor_id
        ))),
        Err(error) => Err(StageError::rejected(format!(
            "sender {} could not be dereferenced: {}",
            actor_id, error
        ))),
    }
}

/// resolve: the object as an already stored Note or Article.
pub(super) async fn resolve_stored_object(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let Some(object_id) = run.activity.object_id().map(str::to_string) else {
        return Err(StageError::rejected(format!("{} has no object", run.activity.id)));
    };

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    run.cache.object = store::find_object(&mut conn, &object_id)
        .await
        .map_err(read_error)?
        .map(Resolved::Object);
    Ok(())
}

/// resolve: the object as an already stored activity.
pub(super) async fn resolve_stored_activity(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let Some(object_id) = run.activity.object_id().map(str::to_string) else {
        return Err(StageError::rejected(format!("{} has no object", run.activity.id)));
    };

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    run.cache.object = store::find_activity(&mut conn, &object_id)
        .await
        .map_err(read_error)?
        .map(Resolved::Activity);
    Ok(())
}

/// validate: drop redeliveries of a stored activity.
pub(super) async fn reject_duplicate(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    if store::activity_exists(&mut conn, &run.activity.id)
        .await
        .map_err(read_error)?
    {
        return Err(ValidateError::AlreadyProcessed(run.activity.id.clone()).into());
    }
    Ok(())
}

/// store: persist a dereferenced sender.
pub(super) async fn store_sender(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    if let Some(actor) = run.cache.remote_actor.take() {
        let conn = stage_conn(&mut run.tx)?;
        store::upsert_actor(conn, &remote_actor_record(&actor))
            .await
            .map_err(StageError::store)?;
        run.cache.actor = store::find_actor(conn, &actor.id)
            .await
            .map_err(StageError::store)?;
    }

    if run.cache.actor.is_none() {
        return Err(StageError::store(format!(
            "sender {} is not stored",
            run.activity.actor
        )));
    }
    Ok(())
}

/// store: persist the activity itself and note whether it is new.
pub(super) async fn store_activity(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let object_type = run
        .cache
        .object
        .as_ref()
        .map(|resolved| resolved.ap_type().to_string())
        .or_else(|| {
            run.activity
                .object
                .as_ref()
                .and_then(|reference| reference.embedded_type())
                .map(str::to_string)
        });
    let record = activity_record(&run.activity, object_type, false);

    let conn = stage_conn(&mut run.tx)?;
    let (id, inserted) = store::upsert_activity(conn, &record)
        .await
        .map_err(StageError::store)?;

    run.cache.stored = inserted;
    run.cache.activity_row = Some(id);
    Ok(())
}
