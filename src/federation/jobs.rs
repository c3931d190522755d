//! Deferred units of work
//!
//! Jobs are serializable so any durable scheduler can carry them. The job
//! worker drains the scheduler's channel and executes each job on its own
//! task.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::engine::Federation;
use super::pipeline::Origin;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Run an inbound document through the pipeline.
    ProcessActivity {
        document: Value,
        #[serde(default)]
        origin: Origin,
    },
    /// POST a signed activity to one recipient.
    Deliver {
        object_id: String,
        from_actor: String,
        to_actor: String,
        activity: Value,
    },
    /// Import a remote actor's outbox into the category of a local Group.
    ImportOutbox { actor_id: String, group_id: String },
}

impl Job {
    pub fn label(&self) -> &'static str {
        match self {
            Job::ProcessActivity { .. } => "process_activity",
            Job::Deliver { .. } => "deliver",
            Job::ImportOutbox { .. } => "import_outbox",
        }
    }
}

/// Execute a single job. Failures are logged; jobs never propagate errors.
pub async fn execute(federation: &Federation, job: Job) {
    let label = job.label();
    match job {
        Job::ProcessActivity { document, origin } => {
            // Aborts are logged and counted by the pipeline itself.
            let _ = federation.process_document(document, origin).await;
        }
        Job::Deliver {
            object_id,
            from_actor,
            to_actor,
            activity,
        } => {
            if let Err(error) = federation
                .delivery()
                .deliver(&from_actor, &to_actor, &activity)
                .await
            {
                tracing::warn!(
                    %error,
                    object_id = %object_id,
                    to = %to_actor,
                    "Delivery failed"
                );
            }
        }
        Job::ImportOutbox { actor_id, group_id } => {
            match super::import::import_outbox(federation, &actor_id, &group_id).await {
                Ok(report) => tracing::info!(
                    actor = %actor_id,
                    units = report.units,
                    failed_units = report.failed_units,
                    orphans = report.orphans,
                    "Outbox import finished"
                ),
                Err(error) => tracing::warn!(%error, actor = %actor_id, "Outbox import failed"),
            }
        }
    }
    tracing::debug!(job = label, "Job finished");
}

/// Drain the scheduler channel until every sender is dropped.
pub async fn run_worker(federation: Arc<Federation>, mut receiver: mpsc::UnboundedReceiver<Job>) {
    tracing::info!("Job worker started");
    while let Some(job) = receiver.recv().await {
        let federation = federation.clone();
        tokio::spawn(async move {
            execute(&federation, job).await;
        });
    }
    tracing::info!("Job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jobs_serialize_with_tag() {
        let job = Job::Deliver {
            object_id: "https://forum.example/ap/note/1".to_string(),
            from_actor: "https://forum.example/ap/group/1".to_string(),
            to_actor: "https://remote.example/users/alice".to_string(),
            activity: json!({ "type": "Announce" }),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["job"], "deliver");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn process_job_defaults_origin() {
        let job: Job = serde_json::from_value(json!({
            "job": "process_activity",
            "document": { "id": "x" }
        }))
        .unwrap();
        assert!(matches!(
            job,
            Job::ProcessActivity { origin, .. } if origin == Origin::default()
        ));
    }
}
