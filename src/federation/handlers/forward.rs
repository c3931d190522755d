//! Forwarding public activities on federated topics to the Group's followers.
//!
//! The Group wraps the original activity in an Announce so receivers see a
//! document signed by the Group's own key.

use chrono::Utc;

use crate::config::ForwardingPolicy;
use crate::data::{NewActivity, store};
use crate::error::StageError;
use crate::federation::delivery::builder;
use crate::federation::engine::Federation;
use crate::federation::pipeline::{ActivityRun, Resolved};

use super::common::group_for_object;

/// forward: re-announce a newly stored public activity from its topic's Group.
pub(super) async fn forward_to_group_followers(
    federation: &Federation,
    run: &mut ActivityRun,
) -> Result<(), StageError> {
    if !run.cache.stored || !run.activity.is_public() {
        return Ok(());
    }

    let mut conn = federation
        .db()
        .acquire()
        .await
        .map_err(StageError::respond_to)?;

    let group = match (&run.cache.target_group, &run.cache.object) {
        (Some(group), _) => Some(group.clone()),
        (None, Some(Resolved::Object(object))) => group_for_object(&mut conn, object)
            .await
            .map_err(StageError::respond_to)?,
        _ => None,
    };
    let Some(group) = group else {
        return Ok(());
    };

    let followers = builder::followers_of(&group.ap_id);
    if federation.config().forwarding_policy == ForwardingPolicy::AddressedOnly
        && !run.activity.addresses(&followers)
    {
        tracing::debug!(
            activity_id = %run.activity.id,
            group = %group.ap_id,
            "Not forwarding activity that does not address the Group's followers"
        );
        return Ok(());
    }

    let recipients: Vec<String> = federation
        .delivery()
        .recipients(&group.ap_id, None)
        .await
        .map_err(StageError::respond_to)?
        .into_iter()
        .filter(|id| *id != run.activity.actor)
        .collect();
    if recipients.is_empty() {
        return Ok(());
    }

    let (to, cc) = builder::public_audience(&group.ap_id);
    let announce_id = federation.mint_id("Announce");
    let announce = builder::announce(
        &announce_id,
        &group.ap_id,
        run.activity.document.clone(),
        &to,
        &cc,
    );

    store::upsert_activity(
        &mut conn,
        &NewActivity {
            ap_id: announce_id.clone(),
            ap_type: "Announce".to_string(),
            actor: group.ap_id.clone(),
            object: Some(run.activity.id.clone()),
            object_type: Some(run.activity.kind.as_str().to_string()),
            target: None,
            public: true,
            published_at: Some(Utc::now()),
            local: true,
            document: announce.to_string(),
        },
    )
    .await
    .map_err(StageError::respond_to)?;
    drop(conn);

    let object_id = run
        .activity
        .object_id()
        .unwrap_or(run.activity.id.as_str())
        .to_string();
    let scheduled = federation
        .delivery()
        .schedule(&announce, &object_id, &group.ap_id, Some(recipients))
        .await
        .map_err(StageError::respond_to)?;

    tracing::debug!(
        activity_id = %run.activity.id,
        group = %group.ap_id,
        recipients = scheduled,
        "Activity forwarded"
    );
    Ok(())
}
