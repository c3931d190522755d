//! Follow, Accept, Reject and Undo.

use chrono::Utc;

use crate::data::{ActivityRecord, NewActivity, content, store};
use crate::error::StageError;
use crate::federation::delivery::builder;
use crate::federation::engine::Federation;
use crate::federation::jobs::Job;
use crate::federation::pipeline::{ActivityRun, Resolved, read_error, stage_conn};
use crate::notify::ContentEvent;

fn resolved_activity(run: &ActivityRun) -> Option<&ActivityRecord> {
    run.cache.object.as_ref().and_then(Resolved::as_activity)
}

// =============================================================================
// Follow
// =============================================================================

/// resolve: the followed local actor.
pub(super) async fn resolve_follow_target(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let Some(target_id) = run.activity.object_id().map(str::to_string) else {
        return Err(StageError::rejected(format!("{} has no object", run.activity.id)));
    };

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    run.cache.object = store::find_actor(&mut conn, &target_id)
        .await
        .map_err(read_error)?
        .filter(|actor| actor.local)
        .map(Resolved::Actor);
    Ok(())
}

/// validate: local target, not already followed. Only category Groups accept.
pub(super) async fn validate_follow(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let target = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_actor)
        .cloned()
        .ok_or_else(|| {
            StageError::rejected(format!("{} does not target a local actor", run.activity.id))
        })?;

    let mut conn = federation.db().acquire().await.map_err(read_error)?;
    if store::is_following(&mut conn, &run.activity.actor, &target.ap_id)
        .await
        .map_err(read_error)?
    {
        return Err(StageError::rejected(format!(
            "{} already follows {}",
            run.activity.actor, target.ap_id
        )));
    }

    run.cache.accepted = target.ap_type == "Group" && target.category_id().is_some();
    Ok(())
}

/// perform: record the follow relation when accepted.
pub(super) async fn perform_follow(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    if !run.cache.accepted {
        return Ok(());
    }
    let followed = run
        .cache
        .object
        .as_ref()
        .map(|resolved| resolved.ap_id().to_string())
        .ok_or_else(|| StageError::perform("Follow target is not stored"))?;

    let conn = stage_conn(&mut run.tx)?;
    store::add_follow(conn, &run.activity.actor, &followed)
        .await
        .map_err(StageError::perform)?;

    run.cache.events.push(ContentEvent::FollowChanged {
        follower: run.activity.actor.clone(),
        followed,
        following: true,
    });
    Ok(())
}

/// respond_to: store an Accept or Reject and schedule it to the follower.
pub(super) async fn respond_to_follow(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let target = run
        .cache
        .object
        .as_ref()
        .map(|resolved| resolved.ap_id().to_string())
        .ok_or_else(|| StageError::respond_to("Follow target is not stored"))?;

    let kind = if run.cache.accepted { "Accept" } else { "Reject" };
    let response_id = federation.mint_id(kind);
    let follow = run.activity.document.clone();
    let response = if run.cache.accepted {
        builder::accept(&response_id, &target, follow)
    } else {
        builder::reject(&response_id, &target, follow)
    };

    let mut conn = federation
        .db()
        .acquire()
        .await
        .map_err(StageError::respond_to)?;
    store::upsert_activity(
        &mut conn,
        &NewActivity {
            ap_id: response_id.clone(),
            ap_type: kind.to_string(),
            actor: target.clone(),
            object: Some(run.activity.id.clone()),
            object_type: Some("Follow".to_string()),
            target: None,
            public: false,
            published_at: Some(Utc::now()),
            local: true,
            document: response.to_string(),
        },
    )
    .await
    .map_err(StageError::respond_to)?;
    drop(conn);

    federation
        .delivery()
        .schedule(
            &response,
            &run.activity.id,
            &target,
            Some(vec![run.activity.actor.clone()]),
        )
        .await
        .map_err(StageError::respond_to)?;

    tracing::info!(
        follow = %run.activity.id,
        follower = %run.activity.actor,
        response = kind,
        "Follow answered"
    );
    Ok(())
}

// =============================================================================
// Accept / Reject
// =============================================================================

/// validate: the object is a Follow we sent to the responder.
pub(super) async fn validate_follow_response(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let follow = resolved_activity(run)
        .filter(|follow| follow.ap_type == "Follow" && follow.local)
        .ok_or_else(|| {
            StageError::rejected(format!("{} does not answer a local Follow", run.activity.id))
        })?;

    if follow.object.as_deref() != Some(run.activity.actor.as_str()) {
        return Err(StageError::rejected(format!(
            "{} was not asked to accept {}",
            run.activity.actor, follow.ap_id
        )));
    }
    Ok(())
}

/// perform: record the follow and import the followed actor's outbox.
pub(super) async fn perform_accept(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let group_id = resolved_activity(run)
        .map(|follow| follow.actor.clone())
        .ok_or_else(|| StageError::perform("accepted Follow is not stored"))?;
    let followed = run.activity.actor.clone();

    let conn = stage_conn(&mut run.tx)?;
    store::add_follow(conn, &group_id, &followed)
        .await
        .map_err(StageError::perform)?;

    federation
        .scheduler()
        .schedule(
            &format!("import:{}:{}", followed, group_id),
            Job::ImportOutbox {
                actor_id: followed.clone(),
                group_id: group_id.clone(),
            },
            None,
        )
        .await
        .map_err(StageError::perform)?;

    run.cache.events.push(ContentEvent::FollowChanged {
        follower: group_id,
        followed,
        following: true,
    });
    Ok(())
}

/// perform: drop the pending follow relation.
pub(super) async fn perform_reject(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let group_id = resolved_activity(run)
        .map(|follow| follow.actor.clone())
        .ok_or_else(|| StageError::perform("rejected Follow is not stored"))?;
    let followed = run.activity.actor.clone();

    let conn = stage_conn(&mut run.tx)?;
    store::remove_follow(conn, &group_id, &followed)
        .await
        .map_err(StageError::perform)?;

    run.cache.events.push(ContentEvent::FollowChanged {
        follower: group_id,
        followed,
        following: false,
    });
    Ok(())
}

// =============================================================================
// Undo
// =============================================================================

/// validate: the sender undoes its own Follow or Like.
pub(super) async fn validate_undo(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let undone = resolved_activity(run).ok_or_else(|| {
        StageError::rejected(format!("{} undoes an unknown activity", run.activity.id))
    })?;

    if undone.actor != run.activity.actor {
        return Err(StageError::rejected(format!(
            "{} cannot undo {} by {}",
            run.activity.actor, undone.ap_id, undone.actor
        )));
    }
    if !matches!(undone.ap_type.as_str(), "Follow" | "Like") {
        return Err(StageError::rejected(format!(
            "{} cannot be undone",
            undone.ap_type
        )));
    }
    Ok(())
}

/// perform: reverse the undone activity.
pub(super) async fn perform_undo(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let undone = resolved_activity(run)
        .cloned()
        .ok_or_else(|| StageError::perform("undone activity is not stored"))?;
    let Some(object_id) = undone.object else {
        return Ok(());
    };

    let conn = stage_conn(&mut run.tx)?;
    match undone.ap_type.as_str() {
        "Follow" => {
            let removed = store::remove_follow(conn, &undone.actor, &object_id)
                .await
                .map_err(StageError::perform)?;
            if removed {
                run.cache.events.push(ContentEvent::FollowChanged {
                    follower: undone.actor,
                    followed: object_id,
                    following: false,
                });
            }
        }
        "Like" => {
            let post_id = store::find_object(conn, &object_id)
                .await
                .map_err(StageError::perform)?
                .and_then(|object| object.post_id);
            let user_id = run.cache.actor.as_ref().and_then(|actor| actor.user_id());
            if let (Some(post_id), Some(user_id)) = (post_id, user_id) {
                if content::remove_like(conn, post_id, user_id)
                    .await
                    .map_err(StageError::perform)?
                {
                    run.cache.events.push(ContentEvent::LikeRemoved { post_id, user_id });
                }
            }
        }
        _ => {}
    }
    Ok(())
}
