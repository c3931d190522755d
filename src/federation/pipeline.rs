//! Activity pipeline
//!
//! Every inbound activity runs the six stages in [`Stage::ORDER`]. Each stage
//! runs the full handler chain registered for the activity's type before the
//! next stage starts; the first handler error aborts the rest of the run.
//!
//! The store and perform stages each run inside one transaction, committed
//! when the stage's handlers all succeed and rolled back otherwise.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::time::Instant;

use super::engine::Federation;
use super::registry::Stage;
use super::types::{self, Activity, ApCategory, ApEntity, ApType, Object};
use crate::data::{ActivityRecord, ActorRecord, CollectionRecord, ObjectRecord, store};
use crate::error::{AppError, StageError};
use crate::metrics::{PIPELINE_DURATION_SECONDS, PIPELINE_RUNS};
use crate::notify::ContentEvent;

/// How an activity reached us.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Origin {
    /// Local actor whose inbox received it; `None` for the shared inbox.
    #[serde(default)]
    pub delivered_to: Option<String>,
    /// Actor that announced the activity, when it arrived wrapped.
    #[serde(default)]
    pub announced_by: Option<String>,
}

/// Stored entity an activity's object resolved to.
#[derive(Debug, Clone)]
pub enum Resolved {
    Object(ObjectRecord),
    Actor(ActorRecord),
    Activity(ActivityRecord),
    Collection(CollectionRecord),
}

impl Resolved {
    pub fn ap_id(&self) -> &str {
        match self {
            Resolved::Object(o) => &o.ap_id,
            Resolved::Actor(a) => &a.ap_id,
            Resolved::Activity(a) => &a.ap_id,
            Resolved::Collection(c) => &c.ap_id,
        }
    }

    pub fn ap_type(&self) -> &str {
        match self {
            Resolved::Object(o) => &o.ap_type,
            Resolved::Actor(a) => &a.ap_type,
            Resolved::Activity(a) => &a.ap_type,
            Resolved::Collection(c) => &c.ap_type,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRecord> {
        match self {
            Resolved::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_actor(&self) -> Option<&ActorRecord> {
        match self {
            Resolved::Actor(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_activity(&self) -> Option<&ActivityRecord> {
        match self {
            Resolved::Activity(a) => Some(a),
            _ => None,
        }
    }
}

/// Scratch state shared by the stages of one run.
#[derive(Debug, Default)]
pub struct RunCache {
    /// Stored sender.
    pub actor: Option<ActorRecord>,
    /// Dereferenced sender, persisted by the store stage.
    pub remote_actor: Option<types::Actor>,
    /// Stored entity the object resolved to.
    pub object: Option<Resolved>,
    /// Object carried by the activity that is not stored yet.
    pub new_object: Option<Object>,
    /// Stored object the new object replies to.
    pub parent: Option<ObjectRecord>,
    /// Local Group the activity was accepted for.
    pub target_group: Option<ActorRecord>,
    /// The activity row was inserted by this run.
    pub stored: bool,
    pub activity_row: Option<i64>,
    pub post_id: Option<i64>,
    /// Follow requests: accept rather than reject.
    pub accepted: bool,
    /// Events published once the perform stage commits.
    pub events: Vec<ContentEvent>,
}

/// One activity moving through the pipeline.
pub struct ActivityRun {
    pub activity: Activity,
    pub origin: Origin,
    pub cache: RunCache,
    pub(crate) tx: Option<Transaction<'static, Sqlite>>,
}

impl ActivityRun {
    pub fn new(activity: Activity, origin: Origin) -> Self {
        Self {
            activity,
            origin,
            cache: RunCache::default(),
            tx: None,
        }
    }
}

/// Connection of the transaction opened for the current stage.
pub(crate) fn stage_conn<'t>(
    tx: &'t mut Option<Transaction<'static, Sqlite>>,
) -> Result<&'t mut SqliteConnection, StageError> {
    tx.as_deref_mut()
        .ok_or_else(|| StageError::store("stage has no open transaction"))
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub activity_id: String,
    pub kind: ApType,
    /// First time this activity was stored.
    pub stored: bool,
}

/// Run every handler registered for `(kind, stage)` in order.
pub async fn run_kind_stage(
    federation: &Federation,
    run: &mut ActivityRun,
    kind: ApType,
    stage: Stage,
) -> Result<(), StageError> {
    for handler in federation.registry().handlers(kind, stage) {
        handler(federation, run).await?;
    }
    Ok(())
}

/// Build, unwrap and run an inbound document.
pub async fn process(
    federation: &Federation,
    document: Value,
    origin: Origin,
) -> Result<PipelineOutcome, StageError> {
    let started = Instant::now();
    let (activity, origin) = prepare(federation, document, origin).await?;
    let kind = activity.kind;
    let activity_id = activity.id.clone();

    let result = run_stages(federation, ActivityRun::new(activity, origin)).await;

    PIPELINE_DURATION_SECONDS
        .with_label_values(&[kind.as_str()])
        .observe(started.elapsed().as_secs_f64());

    match &result {
        Ok(outcome) => {
            PIPELINE_RUNS
                .with_label_values(&[kind.as_str(), "processed"])
                .inc();
            tracing::info!(
                activity_id = %activity_id,
                activity_type = %kind,
                stored = outcome.stored,
                "Activity processed"
            );
        }
        Err(error) if error.is_replay() => {
            PIPELINE_RUNS.with_label_values(&[kind.as_str(), "replay"]).inc();
            tracing::debug!(activity_id = %activity_id, "Activity already processed");
        }
        Err(error) => {
            PIPELINE_RUNS
                .with_label_values(&[kind.as_str(), error.stage_label()])
                .inc();
            match error {
                StageError::Validate(_) => tracing::info!(
                    activity_id = %activity_id,
                    activity_type = %kind,
                    %error,
                    "Activity rejected"
                ),
                _ => tracing::warn!(
                    activity_id = %activity_id,
                    activity_type = %kind,
                    %error,
                    "Activity processing aborted"
                ),
            }
        }
    }

    result
}

async fn run_stages(
    federation: &Federation,
    mut run: ActivityRun,
) -> Result<PipelineOutcome, StageError> {
    let kind = run.activity.kind;
    if !federation.registry().supports(kind) {
        return Err(StageError::rejected(format!("{} activities are not handled", kind)));
    }

    for stage in Stage::ORDER {
        if stage == Stage::Perform && run.cache.object.is_none() {
            return Err(StageError::perform(format!(
                "object of {} did not resolve to a stored entity",
                run.activity.id
            )));
        }

        let transactional = matches!(stage, Stage::Store | Stage::Perform);
        if transactional {
            let tx = federation.db().begin().await.map_err(|e| stage_error(stage, e))?;
            run.tx = Some(tx);
        }

        // An error drops the open transaction, which rolls it back.
        run_kind_stage(federation, &mut run, kind, stage).await?;

        if let Some(tx) = run.tx.take() {
            tx.commit().await.map_err(|e| stage_error(stage, e))?;
        }

        if stage == Stage::Perform {
            for event in run.cache.events.drain(..) {
                federation.notifications().publish(event);
            }
        }
    }

    Ok(PipelineOutcome {
        activity_id: run.activity.id,
        kind,
        stored: run.cache.stored,
    })
}

fn stage_error(stage: Stage, error: impl std::fmt::Display) -> StageError {
    match stage {
        Stage::Perform => StageError::perform(error),
        Stage::RespondTo | Stage::Forward => StageError::respond_to(error),
        _ => StageError::store(error),
    }
}

/// Type the document and unwrap `Announce(activity)` into the inner activity.
async fn prepare(
    federation: &Federation,
    document: Value,
    mut origin: Origin,
) -> Result<(Activity, Origin), StageError> {
    let activity = match types::build_entity(&document) {
        Ok(ApEntity::Activity(activity)) => activity,
        Ok(other) => {
            return Err(StageError::rejected(format!(
                "{} is a {}, not an activity",
                other.id(),
                other.type_name()
            )));
        }
        Err(error) => return Err(StageError::rejected(error.to_string())),
    };

    if activity.kind != ApType::Announce {
        return Ok((activity, origin));
    }

    match announced_activity(federation, &activity).await? {
        Some(inner) => {
            tracing::debug!(
                announce = %activity.id,
                inner = %inner.id,
                "Unwrapped announced activity"
            );
            origin.announced_by = Some(activity.actor.clone());
            Ok((inner, origin))
        }
        None => Ok((activity, origin)),
    }
}

/// The activity an Announce carries, if its object is an activity.
async fn announced_activity(
    federation: &Federation,
    announce: &Activity,
) -> Result<Option<Activity>, StageError> {
    let Some(reference) = announce.object.as_ref() else {
        return Ok(None);
    };

    let document = match &reference.embedded {
        Some(embedded) if is_activity_document(embedded) => embedded.clone(),
        Some(_) => return Ok(None),
        None => {
            let mut conn = federation.db().acquire().await.map_err(read_error)?;
            if store::find_object(&mut conn, &reference.id)
                .await
                .map_err(read_error)?
                .is_some()
            {
                return Ok(None);
            }
            drop(conn);

            match federation.fetcher().fetch_document(&reference.id).await {
                Ok(Some(document)) if is_activity_document(&document) => document,
                Ok(_) => return Ok(None),
                Err(error) => {
                    return Err(StageError::rejected(format!(
                        "announced object {} could not be fetched: {}",
                        reference.id, error
                    )));
                }
            }
        }
    };

    match types::build_entity(&document) {
        Ok(ApEntity::Activity(inner)) => Ok(Some(inner)),
        Ok(_) => Ok(None),
        Err(error) => Err(StageError::rejected(error.to_string())),
    }
}

fn is_activity_document(document: &Value) -> bool {
    types::type_tag(document)
        .and_then(ApType::from_tag)
        .is_some_and(|kind| kind.category() == ApCategory::Activity)
}

/// Map a read failure outside a transaction to a rejection.
pub(crate) fn read_error(error: AppError) -> StageError {
    StageError::rejected(format!("lookup failed: {}", error))
}
