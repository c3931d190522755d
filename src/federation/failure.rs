//! Per-domain delivery health
//!
//! Every failed delivery adds the current UTC day to the domain's set of
//! failure days. Once the set reaches the threshold, every actor at the
//! domain is marked unavailable and skipped by fan-out. Any success clears
//! the set and restores the actors.

use chrono::{NaiveDate, Utc};
use std::sync::Arc;

use crate::data::{Database, store};
use crate::error::AppError;
use crate::metrics::QUARANTINED_DOMAINS;

/// Distinct failure days before a domain is quarantined.
pub const DEFAULT_FAILURE_DAYS_THRESHOLD: u32 = 7;

#[derive(Clone)]
pub struct FailureTracker {
    db: Arc<Database>,
    threshold: u32,
}

impl FailureTracker {
    pub fn new(db: Arc<Database>, threshold: u32) -> Self {
        Self {
            db,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn record_failure(&self, domain: &str) -> Result<bool, AppError> {
        self.record_failure_on(domain, Utc::now().date_naive()).await
    }

    /// Record a failure on `day`. Returns true when this call quarantined
    /// the domain.
    pub async fn record_failure_on(&self, domain: &str, day: NaiveDate) -> Result<bool, AppError> {
        let mut conn = self.db.acquire().await?;

        // The set-add is atomic; concurrent same-day failures collapse.
        store::add_failure_day(&mut conn, domain, day).await?;
        let days = store::count_failure_days(&mut conn, domain).await?;

        if days < i64::from(self.threshold) {
            tracing::debug!(domain = %domain, days, "Delivery failure recorded");
            return Ok(false);
        }

        let changed = store::set_domain_available(&mut conn, domain, false).await?;
        if changed > 0 {
            QUARANTINED_DOMAINS.inc();
            tracing::info!(
                domain = %domain,
                days,
                actors = changed,
                "Domain quarantined after repeated delivery failures"
            );
        }
        Ok(changed > 0)
    }

    /// Clear the failure days after a success. Returns true when the domain
    /// was quarantined before.
    pub async fn record_success(&self, domain: &str) -> Result<bool, AppError> {
        let mut conn = self.db.acquire().await?;
        store::clear_failure_days(&mut conn, domain).await?;

        let restored = store::set_domain_available(&mut conn, domain, true).await?;
        if restored > 0 {
            QUARANTINED_DOMAINS.dec();
            tracing::info!(domain = %domain, actors = restored, "Domain available again");
        }
        Ok(restored > 0)
    }

    /// Distinct failure days currently tracked for `domain`.
    pub async fn failure_days(&self, domain: &str) -> Result<i64, AppError> {
        let mut conn = self.db.acquire().await?;
        store::count_failure_days(&mut conn, domain).await
    }

    /// Whether deliveries to `domain` are still attempted.
    pub async fn domain_available(&self, domain: &str) -> Result<bool, AppError> {
        Ok(self.failure_days(domain).await? < i64::from(self.threshold))
    }
}
