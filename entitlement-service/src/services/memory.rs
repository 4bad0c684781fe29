//! In-process store for local runs and tests.
//!
//! Entitlement, subscription and ledger state sits behind one async mutex so
//! each trait call is atomic, mirroring the transactions of the Postgres store.
//! Rate-limit counters live in a `DashMap` of their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    Entitlement, EventOutcome, ProcessedEvent, QuotaLimit, RecordUsage, Subscription, Tier,
    UsageRecord, UsageType,
};
use crate::reconciler::ReconcilePlan;
use crate::services::store::{
    CommitOutcome, EntitlementStore, EventRef, PruneStats, Reservation,
};

#[derive(Default)]
struct MemoryState {
    entitlements: HashMap<String, Entitlement>,
    subscriptions: HashMap<String, Subscription>,
    usage: Vec<UsageRecord>,
    processed: HashMap<String, ProcessedEvent>,
}

struct RateCounter {
    count: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    rate_counters: DashMap<(String, DateTime<Utc>), RateCounter>,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`. Used to exercise store timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Overwrite a row wholesale. Test setup only; production writes go
    /// through plans and reservations.
    pub async fn put_entitlement(&self, entitlement: Entitlement) {
        let mut state = self.state.lock().await;
        state
            .entitlements
            .insert(entitlement.user_id.clone(), entitlement);
    }

    pub async fn put_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription.subscription_id.clone(), subscription);
    }
}

fn insert_usage(state: &mut MemoryState, usage: &RecordUsage) -> UsageRecord {
    let record = usage.clone().into_record(Uuid::new_v4(), Utc::now());
    state.usage.push(record.clone());
    record
}

fn insert_processed(state: &mut MemoryState, event: EventRef<'_>, outcome: EventOutcome) -> bool {
    if state.processed.contains_key(event.event_id) {
        return false;
    }
    state.processed.insert(
        event.event_id.to_string(),
        ProcessedEvent {
            event_id: event.event_id.to_string(),
            event_type: event.event_type.to_string(),
            outcome,
            processed_at: Utc::now(),
        },
    );
    true
}

/// Same predicate as the conditional `UPDATE` in the Postgres store.
fn may_consume(entitlement: &Entitlement) -> bool {
    entitlement.quota_remaining > 0
        && !entitlement.quota_limit.is_unlimited()
        && (entitlement.tier == Tier::Free || entitlement.status.permits_consumption())
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.simulate_latency().await;
        Ok(())
    }

    async fn ensure_entitlement(
        &self,
        user_id: &str,
        free_limit: QuotaLimit,
    ) -> Result<Entitlement, AppError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        let entitlement = state
            .entitlements
            .entry(user_id.to_string())
            .or_insert_with(|| Entitlement::new_free(user_id, free_limit, Utc::now()));
        Ok(entitlement.clone())
    }

    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, AppError> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state.entitlements.get(user_id).cloned())
    }

    async fn find_entitlement_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Entitlement>, AppError> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state
            .entitlements
            .values()
            .find(|e| e.external_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state.subscriptions.get(subscription_id).cloned())
    }

    async fn find_subscription_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.customer_id.as_deref() == Some(customer_id))
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        let mut rows: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn get_processed_event(
        &self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, AppError> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state.processed.get(event_id).cloned())
    }

    async fn record_event(
        &self,
        event: EventRef<'_>,
        outcome: EventOutcome,
    ) -> Result<bool, AppError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        Ok(insert_processed(&mut state, event, outcome))
    }

    async fn commit_plan(
        &self,
        event: EventRef<'_>,
        plan: &ReconcilePlan,
    ) -> Result<CommitOutcome, AppError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        if state.processed.contains_key(event.event_id) {
            return Ok(CommitOutcome::Duplicate);
        }

        let current = state
            .entitlements
            .get(&plan.user_id)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("No entitlement for user {}", plan.user_id))
            })?;

        let now = Utc::now();

        if plan.is_stale_against(&current) {
            if let Some(subscription) = &plan.subscription {
                if !state.subscriptions.contains_key(&subscription.subscription_id) {
                    let mut row = subscription.clone();
                    row.updated_utc = now;
                    state.subscriptions.insert(row.subscription_id.clone(), row);
                    if let Some(next) = plan.stale_backfill(&current, now) {
                        state.entitlements.insert(next.user_id.clone(), next);
                    }
                }
            }
            insert_processed(&mut state, event, EventOutcome::Stale);
            return Ok(CommitOutcome::Stale);
        }

        let mut next = match &plan.patch {
            Some(patch) => patch.apply(&current, now),
            None => current.clone(),
        };
        next.last_applied_event_ts = plan.next_watermark(current.last_applied_event_ts);
        state.entitlements.insert(next.user_id.clone(), next);

        if let Some(subscription) = &plan.subscription {
            let mut row = subscription.clone();
            row.updated_utc = now;
            state.subscriptions.insert(row.subscription_id.clone(), row);
        }

        if let Some(usage) = &plan.usage {
            insert_usage(&mut state, usage);
        }

        insert_processed(&mut state, event, EventOutcome::Applied);
        Ok(CommitOutcome::Applied)
    }

    async fn reserve_quota(&self, user_id: &str) -> Result<Reservation, AppError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        let Some(entitlement) = state.entitlements.get_mut(user_id) else {
            return Ok(Reservation::Exhausted);
        };
        if !may_consume(entitlement) {
            return Ok(Reservation::Exhausted);
        }

        entitlement.quota_remaining -= 1;
        entitlement.updated_utc = Utc::now();
        let remaining = entitlement.quota_remaining;
        let subscription_id = entitlement.external_subscription_id.clone();

        insert_usage(
            &mut state,
            &RecordUsage {
                user_id: user_id.to_string(),
                subscription_id,
                usage_type: UsageType::AnalysisCreated,
                quantity: 1,
                metadata: Some(serde_json::json!({ "remaining_after": remaining })),
            },
        );

        Ok(Reservation::Reserved { remaining })
    }

    async fn append_usage(&self, usage: &RecordUsage) -> Result<UsageRecord, AppError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        Ok(insert_usage(&mut state, usage))
    }

    async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageRecord>, AppError> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state
            .usage
            .iter()
            .filter(|u| u.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn increment_rate_counter(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        self.simulate_latency().await;
        let mut counter = self
            .rate_counters
            .entry((key.to_string(), window_start))
            .or_insert(RateCounter {
                count: 0,
                expires_at,
            });
        counter.count += 1;
        Ok(counter.count)
    }

    async fn prune(
        &self,
        processed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PruneStats, AppError> {
        self.simulate_latency().await;
        let mut stats = PruneStats::default();

        {
            let mut state = self.state.lock().await;
            let before = state.processed.len();
            state
                .processed
                .retain(|_, event| event.processed_at >= processed_before);
            stats.processed_events = (before - state.processed.len()) as u64;
        }

        let before = self.rate_counters.len();
        self.rate_counters
            .retain(|_, counter| counter.expires_at > now);
        stats.rate_counters = before.saturating_sub(self.rate_counters.len()) as u64;

        Ok(stats)
    }
}
