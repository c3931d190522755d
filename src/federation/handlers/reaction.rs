//! Like and Announce of stored objects.

use crate::data::content;
use crate::error::StageError;
use crate::federation::engine::Federation;
use crate::federation::pipeline::{ActivityRun, Resolved, stage_conn};
use crate::notify::ContentEvent;

use super::common::ensure_user;

/// validate: the object is a live post.
pub(super) async fn validate_like(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let object = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_object)
        .ok_or_else(|| StageError::rejected(format!("{} likes an unknown object", run.activity.id)))?;

    if object.is_tombstone() || object.post_id.is_none() {
        return Err(StageError::rejected(format!(
            "{} has no live post to like",
            object.ap_id
        )));
    }
    Ok(())
}

/// perform: like the post as the sender's user.
pub(super) async fn perform_like(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    let post_id = run
        .cache
        .object
        .as_ref()
        .and_then(Resolved::as_object)
        .and_then(|object| object.post_id)
        .ok_or_else(|| StageError::perform("liked object has no post"))?;

    let conn = stage_conn(&mut run.tx)?;
    let actor = run
        .cache
        .actor
        .as_mut()
        .ok_or_else(|| StageError::perform("sender is not stored"))?;
    let user_id = ensure_user(conn, actor).await.map_err(StageError::perform)?;

    if content::add_like(conn, post_id, user_id)
        .await
        .map_err(StageError::perform)?
    {
        run.cache.post_id = Some(post_id);
        run.cache.events.push(ContentEvent::LikeAdded { post_id, user_id });
    }
    Ok(())
}

/// validate: an Announce that was not unwrapped must point at a stored object.
pub(super) async fn validate_announce(
    _federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    match &run.cache.object {
        Some(Resolved::Object(_)) => Ok(()),
        _ => Err(StageError::rejected(format!(
            "{} announces an unknown object",
            run.activity.id
        ))),
    }
}
