//! Storage seam shared by the reconciler and the gates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

use crate::models::{
    Entitlement, EventOutcome, ProcessedEvent, QuotaLimit, RecordUsage, Subscription, UsageRecord,
};
use crate::reconciler::ReconcilePlan;

/// Result of committing a reconciliation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The event predates the row's watermark; only the marker was written.
    Stale,
    /// Another delivery already recorded the event; nothing was written.
    Duplicate,
}

/// Result of the atomic conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved { remaining: i32 },
    /// No row matched the conditional update.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub processed_events: u64,
    pub rate_counters: u64,
}

/// Identity of the event a write belongs to.
#[derive(Debug, Clone, Copy)]
pub struct EventRef<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
}

/// Durable store for entitlements, subscriptions, the usage ledger, the
/// processed-event ledger and shared rate-limit counters.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    /// Create the free-tier row for `user_id` if absent and return the row.
    async fn ensure_entitlement(
        &self,
        user_id: &str,
        free_limit: QuotaLimit,
    ) -> Result<Entitlement, AppError>;

    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, AppError>;

    async fn find_entitlement_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Entitlement>, AppError>;

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// Most recently created subscription for a processor customer.
    async fn find_subscription_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError>;

    async fn get_processed_event(&self, event_id: &str)
        -> Result<Option<ProcessedEvent>, AppError>;

    /// Record an event that changes no entitlement state. Returns `false` when
    /// the event id was already recorded.
    async fn record_event(
        &self,
        event: EventRef<'_>,
        outcome: EventOutcome,
    ) -> Result<bool, AppError>;

    /// Apply `plan` and mark the event processed in one transaction.
    async fn commit_plan(
        &self,
        event: EventRef<'_>,
        plan: &ReconcilePlan,
    ) -> Result<CommitOutcome, AppError>;

    /// Decrement remaining quota by one if the row still permits consumption,
    /// appending the `analysis_created` ledger row in the same transaction.
    async fn reserve_quota(&self, user_id: &str) -> Result<Reservation, AppError>;

    async fn append_usage(&self, usage: &RecordUsage) -> Result<UsageRecord, AppError>;

    async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageRecord>, AppError>;

    /// Increment the fixed-window counter for `key` and return the new count.
    async fn increment_rate_counter(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    /// Delete processed events older than `processed_before` and rate
    /// counters expired at `now`.
    async fn prune(
        &self,
        processed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PruneStats, AppError>;
}
