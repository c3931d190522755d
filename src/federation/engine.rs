//! Federation engine
//!
//! [`Federation`] owns every collaborator the pipeline, delivery and graph
//! importers need. It is built once at startup, after the handler registry
//! is populated, and shared behind an `Arc`.

use serde_json::Value;
use std::sync::Arc;

use super::delivery::Delivery;
use super::failure::FailureTracker;
use super::fetch::Fetcher;
use super::ids;
use super::jobs::Job;
use super::pipeline::{self, Origin, PipelineOutcome};
use super::registry::HandlerRegistry;
use super::scheduler::TaskScheduler;
use crate::config::FederationConfig;
use crate::data::Database;
use crate::error::{AppError, StageError};
use crate::notify::NotificationBus;

/// RSA modulus size for local actor keys.
pub const ACTOR_KEY_BITS: usize = 2048;

pub struct Federation {
    db: Arc<Database>,
    config: FederationConfig,
    base_url: String,
    domain: String,
    registry: Arc<HandlerRegistry>,
    fetcher: Fetcher,
    delivery: Delivery,
    failures: FailureTracker,
    scheduler: Arc<dyn TaskScheduler>,
    notifications: NotificationBus,
    actor_key_bits: usize,
}

impl Federation {
    pub fn new(
        db: Arc<Database>,
        config: FederationConfig,
        base_url: &str,
        registry: HandlerRegistry,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<Self, AppError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&base_url)
            .map_err(|e| AppError::Config(format!("Invalid base URL {}: {}", base_url, e)))?;
        let domain = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(AppError::Config("Base URL has no host".to_string())),
        };

        let fetcher = Fetcher::new(config.fetch_timeout(), config.allow_private_hosts)?;
        let failures = FailureTracker::new(db.clone(), config.failure_days_threshold);
        let delivery = Delivery::new(
            db.clone(),
            fetcher.clone(),
            scheduler.clone(),
            failures.clone(),
            config.delivery_delay(),
        );

        tracing::info!(
            base_url = %base_url,
            handlers = registry.len(),
            "Federation engine initialized"
        );

        Ok(Self {
            db,
            config,
            base_url,
            domain,
            registry: Arc::new(registry),
            fetcher,
            delivery,
            failures,
            scheduler,
            notifications: NotificationBus::new(),
            actor_key_bits: ACTOR_KEY_BITS,
        })
    }

    /// Use a smaller key size for locally generated actor keys.
    pub fn with_actor_key_bits(mut self, bits: usize) -> Self {
        self.actor_key_bits = bits;
        self
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Host (and non-default port) local actors live on.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    pub fn actor_key_bits(&self) -> usize {
        self.actor_key_bits
    }

    pub fn mint_id(&self, ap_type: &str) -> String {
        ids::mint_ap_id(&self.base_url, ap_type)
    }

    pub fn is_local_id(&self, ap_id: &str) -> bool {
        ids::is_local_id(&self.base_url, ap_id)
    }

    /// Run one inbound document through the pipeline now.
    pub async fn process_document(
        &self,
        document: Value,
        origin: Origin,
    ) -> Result<PipelineOutcome, StageError> {
        pipeline::process(self, document, origin).await
    }

    /// Hand an inbound document to the scheduler for deferred processing.
    pub async fn enqueue_inbound(&self, document: Value, origin: Origin) -> Result<(), AppError> {
        let key = match document.get("id").and_then(Value::as_str) {
            Some(id) => format!("process:{}", id),
            None => return Err(AppError::Unprocessable("Document has no id".to_string())),
        };
        self.scheduler
            .schedule(&key, Job::ProcessActivity { document, origin }, None)
            .await?;
        Ok(())
    }
}
