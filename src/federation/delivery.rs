//! Activity delivery
//!
//! Outbound activities are never sent on the publishing task. [`Delivery::schedule`]
//! resolves the recipients and schedules one `Deliver` job per recipient, keyed
//! by `(object, from, to)` so a later schedule for the same triple replaces the
//! pending one. The job worker then calls [`Delivery::deliver`], which signs
//! and POSTs the activity and feeds the outcome into failure tracking.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::envelope::ACTIVITY_JSON;
use super::failure::FailureTracker;
use super::fetch::Fetcher;
use super::jobs::Job;
use super::rate_limit::extract_domain;
use super::scheduler::TaskScheduler;
use super::signature::sign_request;
use crate::data::{ActorRecord, Database, store};
use crate::error::AppError;
use crate::metrics::DELIVERIES_TOTAL;

/// Scheduler key of the pending delivery for a triple. Parts are separated
/// by newlines, which cannot occur in an IRI.
pub fn delivery_key(object_id: &str, from_actor: &str, to_actor: &str) -> String {
    format!("deliver\n{}\n{}\n{}", object_id, from_actor, to_actor)
}

#[derive(Clone)]
pub struct Delivery {
    db: Arc<Database>,
    fetcher: Fetcher,
    scheduler: Arc<dyn TaskScheduler>,
    failures: FailureTracker,
    delay: Option<Duration>,
}

impl Delivery {
    pub fn new(
        db: Arc<Database>,
        fetcher: Fetcher,
        scheduler: Arc<dyn TaskScheduler>,
        failures: FailureTracker,
        delay: Option<Duration>,
    ) -> Self {
        Self {
            db,
            fetcher,
            scheduler,
            failures,
            delay,
        }
    }

    /// Recipients for an activity sent by `from_actor`.
    ///
    /// Without an explicit list this is the actor's followers. Quarantined
    /// and local actors are skipped either way; duplicates collapse.
    pub async fn recipients(
        &self,
        from_actor: &str,
        explicit: Option<Vec<String>>,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.db.acquire().await?;

        let candidates = match explicit {
            Some(ids) => {
                let mut kept = Vec::with_capacity(ids.len());
                for id in ids {
                    match store::find_actor(&mut conn, &id).await? {
                        Some(actor) if actor.local || !actor.available => {}
                        _ => kept.push(id),
                    }
                }
                kept
            }
            None => store::available_followers(&mut conn, from_actor)
                .await?
                .into_iter()
                .filter(|actor| !actor.local)
                .map(|actor| actor.ap_id)
                .collect(),
        };

        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|id| id != from_actor && seen.insert(id.clone()))
            .collect())
    }

    /// Schedule `activity` to every recipient. Returns the number scheduled.
    pub async fn schedule(
        &self,
        activity: &Value,
        object_id: &str,
        from_actor: &str,
        recipients: Option<Vec<String>>,
    ) -> Result<usize, AppError> {
        let recipients = self.recipients(from_actor, recipients).await?;
        for to_actor in &recipients {
            self.schedule_one(activity, object_id, from_actor, to_actor)
                .await?;
        }

        tracing::debug!(
            object_id = %object_id,
            from = %from_actor,
            recipients = recipients.len(),
            "Delivery scheduled"
        );
        Ok(recipients.len())
    }

    /// Schedule a single delivery, replacing one still pending for the triple.
    pub async fn schedule_one(
        &self,
        activity: &Value,
        object_id: &str,
        from_actor: &str,
        to_actor: &str,
    ) -> Result<bool, AppError> {
        let job = Job::Deliver {
            object_id: object_id.to_string(),
            from_actor: from_actor.to_string(),
            to_actor: to_actor.to_string(),
            activity: activity.clone(),
        };
        self.scheduler
            .schedule(
                &delivery_key(object_id, from_actor, to_actor),
                job,
                self.delay,
            )
            .await
    }

    pub async fn has_pending(&self, object_id: &str, from_actor: &str, to_actor: &str) -> bool {
        self.scheduler
            .is_pending(&delivery_key(object_id, from_actor, to_actor))
            .await
    }

    pub async fn cancel_pending(&self, object_id: &str, from_actor: &str, to_actor: &str) -> bool {
        self.scheduler
            .cancel(&delivery_key(object_id, from_actor, to_actor))
            .await
    }

    /// Sign and POST `activity` to the inbox of `to_actor`.
    pub async fn deliver(
        &self,
        from_actor: &str,
        to_actor: &str,
        activity: &Value,
    ) -> Result<(), AppError> {
        let mut conn = self.db.acquire().await?;

        let sender = store::find_actor(&mut conn, from_actor)
            .await?
            .filter(|actor| actor.local)
            .ok_or_else(|| AppError::Federation(format!("{} is not a local actor", from_actor)))?;
        let private_key_pem = sender.private_key_pem.as_deref().ok_or_else(|| {
            AppError::Federation(format!("{} has no signing key", from_actor))
        })?;

        let recipient = store::find_actor(&mut conn, to_actor).await?;
        drop(conn);

        if recipient.as_ref().is_some_and(|actor| !actor.available) {
            tracing::debug!(to = %to_actor, "Skipping delivery to quarantined actor");
            DELIVERIES_TOTAL.with_label_values(&["skipped"]).inc();
            return Ok(());
        }

        let domain = match &recipient {
            Some(actor) => actor.domain.clone(),
            None => extract_domain(to_actor),
        };

        // An unreachable actor document counts against the domain like a failed POST.
        let sent = match self.inbox_for(to_actor, recipient.as_ref()).await {
            Ok(inbox) => self
                .post(&sender, private_key_pem, &inbox, activity)
                .await
                .map(|()| inbox),
            Err(error) => Err(error),
        };

        match sent {
            Ok(inbox) => {
                DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
                self.failures.record_success(&domain).await?;
                tracing::debug!(inbox = %inbox, "Activity delivered");
                Ok(())
            }
            Err(error) => {
                DELIVERIES_TOTAL.with_label_values(&["failure"]).inc();
                self.failures.record_failure(&domain).await?;
                tracing::warn!(%error, to = %to_actor, domain = %domain, "Delivery attempt failed");
                Err(error)
            }
        }
    }

    async fn inbox_for(
        &self,
        actor_id: &str,
        stored: Option<&ActorRecord>,
    ) -> Result<String, AppError> {
        if let Some(inbox) = stored.and_then(|actor| actor.inbox.clone()) {
            return Ok(inbox);
        }

        self.fetcher
            .fetch_actor(actor_id)
            .await?
            .and_then(|actor| actor.inbox)
            .ok_or_else(|| AppError::Federation(format!("No inbox for {}", actor_id)))
    }

    async fn post(
        &self,
        sender: &ActorRecord,
        private_key_pem: &str,
        inbox: &str,
        activity: &Value,
    ) -> Result<(), AppError> {
        let url = self.fetcher.check_url(inbox).await?;
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let signed = sign_request(
            "POST",
            url.as_str(),
            Some(&body),
            private_key_pem,
            &sender.key_id(),
            Utc::now(),
        )?;

        let mut request = self
            .fetcher
            .client()
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::DATE, signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to deliver to {}: {}", inbox, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox,
                response.status()
            )));
        }
        Ok(())
    }
}

/// JSON builders for outbound documents.
pub mod builder {
    use serde_json::{Map, Value, json};

    use crate::data::ActorRecord;
    use crate::federation::envelope::{AS_CONTEXT, AS_PUBLIC};

    const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

    /// Followers collection of a local actor.
    pub fn followers_of(actor_id: &str) -> String {
        format!("{}/followers", actor_id)
    }

    /// Public addressing: `to` the public collection, `cc` the followers.
    pub fn public_audience(actor_id: &str) -> (Vec<String>, Vec<String>) {
        (vec![AS_PUBLIC.to_string()], vec![followers_of(actor_id)])
    }

    fn activity(
        kind: &str,
        id: &str,
        actor: &str,
        object: Value,
        to: &[String],
        cc: &[String],
    ) -> Value {
        let mut document = json!({
            "@context": AS_CONTEXT,
            "type": kind,
            "id": id,
            "actor": actor,
            "object": object,
        });
        if let Value::Object(map) = &mut document {
            if !to.is_empty() {
                map.insert("to".to_string(), json!(to));
            }
            if !cc.is_empty() {
                map.insert("cc".to_string(), json!(cc));
            }
        }
        document
    }

    /// Fields of a Note or Article.
    #[derive(Debug, Clone, Default)]
    pub struct NoteFields<'a> {
        pub name: Option<&'a str>,
        pub in_reply_to: Option<&'a str>,
        pub context: Option<&'a str>,
        pub audience: Option<&'a str>,
        pub updated: Option<&'a str>,
    }

    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        fields: NoteFields<'_>,
        to: &[String],
        cc: &[String],
    ) -> Value {
        let mut map = Map::new();
        map.insert("@context".to_string(), json!(AS_CONTEXT));
        map.insert("type".to_string(), json!("Note"));
        map.insert("id".to_string(), json!(id));
        map.insert("attributedTo".to_string(), json!(attributed_to));
        map.insert("content".to_string(), json!(content));
        map.insert("published".to_string(), json!(published));
        map.insert("to".to_string(), json!(to));
        map.insert("cc".to_string(), json!(cc));
        for (key, value) in [
            ("name", fields.name),
            ("inReplyTo", fields.in_reply_to),
            ("context", fields.context),
            ("audience", fields.audience),
            ("updated", fields.updated),
        ] {
            if let Some(value) = value {
                map.insert(key.to_string(), json!(value));
            }
        }
        Value::Object(map)
    }

    pub fn create(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        let mut document = activity("Create", id, actor, object, to, cc);
        document["published"] = json!(chrono::Utc::now().to_rfc3339());
        document
    }

    pub fn update(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        activity("Update", id, actor, object, to, cc)
    }

    pub fn delete(id: &str, actor: &str, object_id: &str, to: &[String], cc: &[String]) -> Value {
        activity(
            "Delete",
            id,
            actor,
            json!({ "type": "Tombstone", "id": object_id }),
            to,
            cc,
        )
    }

    /// Announce by a Group; `object` is usually the embedded activity.
    pub fn announce(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        let mut document = activity("Announce", id, actor, object, to, cc);
        document["published"] = json!(chrono::Utc::now().to_rfc3339());
        document
    }

    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        activity("Follow", id, actor, json!(object), &[], &[])
    }

    pub fn accept(id: &str, actor: &str, follow: Value) -> Value {
        activity("Accept", id, actor, follow, &[], &[])
    }

    pub fn reject(id: &str, actor: &str, follow: Value) -> Value {
        activity("Reject", id, actor, follow, &[], &[])
    }

    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        activity("Undo", id, actor, object, &[], &[])
    }

    /// Public document of a local actor.
    pub fn actor_document(actor: &ActorRecord) -> Value {
        json!({
            "@context": [AS_CONTEXT, SECURITY_CONTEXT],
            "id": actor.ap_id,
            "type": actor.ap_type,
            "preferredUsername": actor.username,
            "name": actor.name,
            "inbox": actor.inbox,
            "outbox": actor.outbox,
            "followers": followers_of(&actor.ap_id),
            "publicKey": {
                "id": actor.key_id(),
                "owner": actor.ap_id,
                "publicKeyPem": actor.public_key_pem,
            }
        })
    }

    pub fn ordered_collection(id: &str, total_items: usize, items: Option<Vec<Value>>) -> Value {
        let mut document = json!({
            "@context": AS_CONTEXT,
            "type": "OrderedCollection",
            "id": id,
            "totalItems": total_items,
        });
        if let Some(items) = items {
            document["orderedItems"] = Value::Array(items);
        }
        document
    }
}
