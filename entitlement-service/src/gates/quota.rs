use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::{DenyReason, QuotaDecision, Redirects};
use crate::models::{Entitlement, RecordUsage, Tier, UsageType};
use crate::services::{
    record_quota_decision, with_timeout, EntitlementStore, RateDecision, RateLimiter, Reservation,
};

const RATE_SCOPE: &str = "quota";

/// Pre-check on a snapshot. The decrement itself re-checks atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaEvaluation {
    Unlimited,
    Reserve,
    Deny(DenyReason),
}

impl QuotaEvaluation {
    pub fn evaluate(entitlement: &Entitlement) -> Self {
        let free = entitlement.tier == Tier::Free;

        // Past-due paid tiers keep consuming during the retry window, limited or not.
        if !(free || entitlement.status.permits_consumption()) {
            return QuotaEvaluation::Deny(DenyReason::SubscriptionInactive);
        }

        if entitlement.quota_limit.is_unlimited() {
            return QuotaEvaluation::Unlimited;
        }

        if entitlement.quota_remaining <= 0 {
            return QuotaEvaluation::Deny(DenyReason::QuotaExhausted);
        }

        QuotaEvaluation::Reserve
    }
}

#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<dyn EntitlementStore>,
    limiter: RateLimiter,
    redirects: Redirects,
    timeout: Duration,
}

impl QuotaGate {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        limiter: RateLimiter,
        redirects: Redirects,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            limiter,
            redirects,
            timeout,
        }
    }

    /// Reserve one unit of quota for `user_id`, or say why not.
    #[tracing::instrument(skip(self))]
    pub async fn check_and_reserve(&self, user_id: &str) -> QuotaDecision {
        let decision = self.decide(user_id).await;
        record_quota_decision(
            decision.allowed,
            decision.reason.map(|r| r.as_str()).unwrap_or("none"),
        );
        info!(
            user_id = %user_id,
            allowed = decision.allowed,
            reason = decision.reason.map(|r| r.as_str()).unwrap_or("none"),
            remaining = ?decision.remaining,
            "Quota decision"
        );
        decision
    }

    async fn decide(&self, user_id: &str) -> QuotaDecision {
        let rate = with_timeout(
            "increment_rate_counter",
            self.timeout,
            self.limiter.check(RATE_SCOPE, user_id, Utc::now()),
        )
        .await;
        match rate {
            Ok(RateDecision::Allowed) => {}
            Ok(RateDecision::Limited { retry_after_secs }) => {
                warn!(user_id = %user_id, retry_after_secs, "Quota check rate limited");
                return self.deny(DenyReason::RateLimited, None);
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Rate limiter unavailable");
                return self.deny(DenyReason::Unavailable, None);
            }
        }

        let entitlement = match with_timeout(
            "get_entitlement",
            self.timeout,
            self.store.get_entitlement(user_id),
        )
        .await
        {
            Ok(Some(entitlement)) => entitlement,
            Ok(None) => return self.deny(DenyReason::ProfileNotFound, None),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Entitlement lookup failed");
                return self.deny(DenyReason::Unavailable, None);
            }
        };
        let tier = entitlement.tier;

        match QuotaEvaluation::evaluate(&entitlement) {
            QuotaEvaluation::Deny(reason) => self.deny(reason, Some(tier)),
            QuotaEvaluation::Unlimited => {
                let usage = RecordUsage {
                    user_id: user_id.to_string(),
                    subscription_id: entitlement.external_subscription_id.clone(),
                    usage_type: UsageType::AnalysisCreated,
                    quantity: 1,
                    metadata: Some(json!({ "unlimited": true })),
                };
                match with_timeout(
                    "append_usage",
                    self.timeout,
                    self.store.append_usage(&usage),
                )
                .await
                {
                    Ok(_) => QuotaDecision::unlimited(tier),
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Usage append failed");
                        self.deny(DenyReason::Unavailable, Some(tier))
                    }
                }
            }
            QuotaEvaluation::Reserve => {
                match with_timeout(
                    "reserve_quota",
                    self.timeout,
                    self.store.reserve_quota(user_id),
                )
                .await
                {
                    Ok(Reservation::Reserved { remaining }) => {
                        QuotaDecision::reserved(tier, remaining)
                    }
                    // Lost a race with a concurrent reservation or a status change.
                    Ok(Reservation::Exhausted) => self.deny(DenyReason::QuotaExhausted, Some(tier)),
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Quota reservation failed");
                        self.deny(DenyReason::Unavailable, Some(tier))
                    }
                }
            }
        }
    }

    fn deny(&self, reason: DenyReason, tier: Option<Tier>) -> QuotaDecision {
        QuotaDecision::denied(reason, tier, &self.redirects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntitlementStatus, QuotaLimit};
    use crate::services::MemoryStore;

    fn redirects() -> Redirects {
        Redirects {
            upgrade_url: "/pricing".to_string(),
            billing_url: "/account/billing".to_string(),
        }
    }

    fn gate(store: Arc<MemoryStore>, per_minute: u32) -> QuotaGate {
        let store: Arc<dyn EntitlementStore> = store;
        QuotaGate::new(
            store.clone(),
            RateLimiter::per_minute(store, per_minute),
            redirects(),
            Duration::from_secs(1),
        )
    }

    fn entitlement(tier: Tier, status: EntitlementStatus, limit: QuotaLimit, remaining: i32) -> Entitlement {
        let mut e = Entitlement::new_free("user-1", QuotaLimit::Limited(1), Utc::now());
        e.tier = tier;
        e.status = status;
        e.quota_limit = limit;
        e.quota_remaining = remaining;
        e
    }

    #[test]
    fn past_due_may_still_consume() {
        let e = entitlement(Tier::Pro, EntitlementStatus::PastDue, QuotaLimit::Limited(10), 3);
        assert_eq!(QuotaEvaluation::evaluate(&e), QuotaEvaluation::Reserve);
    }

    #[test]
    fn canceled_paid_tier_is_inactive() {
        let e = entitlement(Tier::Pro, EntitlementStatus::Canceled, QuotaLimit::Limited(10), 3);
        assert_eq!(
            QuotaEvaluation::evaluate(&e),
            QuotaEvaluation::Deny(DenyReason::SubscriptionInactive)
        );
    }

    #[test]
    fn unlimited_follows_the_same_standing_rule_as_limited() {
        let active = entitlement(Tier::Enterprise, EntitlementStatus::Active, QuotaLimit::Unlimited, 0);
        assert_eq!(QuotaEvaluation::evaluate(&active), QuotaEvaluation::Unlimited);

        let past_due = entitlement(Tier::Enterprise, EntitlementStatus::PastDue, QuotaLimit::Unlimited, 0);
        assert_eq!(QuotaEvaluation::evaluate(&past_due), QuotaEvaluation::Unlimited);

        let canceled = entitlement(Tier::Enterprise, EntitlementStatus::Canceled, QuotaLimit::Unlimited, 0);
        assert_eq!(
            QuotaEvaluation::evaluate(&canceled),
            QuotaEvaluation::Deny(DenyReason::SubscriptionInactive)
        );
    }

    #[tokio::test]
    async fn free_user_gets_one_then_exhausted() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_entitlement(entitlement(Tier::Free, EntitlementStatus::None, QuotaLimit::Limited(1), 1))
            .await;
        let gate = gate(store.clone(), 0);

        let first = gate.check_and_reserve("user-1").await;
        assert!(first.allowed);
        assert_eq!(first.remaining, Some(0));

        let second = gate.check_and_reserve("user-1").await;
        assert!(!second.allowed);
        assert_eq!(second.reason, Some(DenyReason::QuotaExhausted));
        assert_eq!(second.redirect.as_deref(), Some("/pricing"));

        let usage = store.list_usage("user-1").await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].metadata.as_ref().unwrap()["remaining_after"], 0);
    }

    #[tokio::test]
    async fn unlimited_leaves_remaining_untouched() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_entitlement(entitlement(Tier::Enterprise, EntitlementStatus::Active, QuotaLimit::Unlimited, 0))
            .await;
        let gate = gate(store.clone(), 0);

        let decision = gate.check_and_reserve("user-1").await;
        assert!(decision.allowed && decision.unlimited);
        assert_eq!(decision.remaining, None);
        let row = store.get_entitlement("user-1").await.unwrap().unwrap();
        assert_eq!(row.quota_remaining, 0);
    }

    #[tokio::test]
    async fn unknown_user_is_profile_not_found() {
        let gate = gate(Arc::new(MemoryStore::new()), 0);
        let decision = gate.check_and_reserve("ghost").await;
        assert_eq!(decision.reason, Some(DenyReason::ProfileNotFound));
    }

    #[tokio::test]
    async fn rate_limit_denies_before_touching_quota() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_entitlement(entitlement(Tier::Pro, EntitlementStatus::Active, QuotaLimit::Limited(10), 10))
            .await;
        let gate = gate(store.clone(), 1);

        assert!(gate.check_and_reserve("user-1").await.allowed);
        let limited = gate.check_and_reserve("user-1").await;
        assert_eq!(limited.reason, Some(DenyReason::RateLimited));

        let row = store.get_entitlement("user-1").await.unwrap().unwrap();
        assert_eq!(row.quota_remaining, 9);
    }

    #[tokio::test]
    async fn slow_store_fails_closed() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_entitlement(entitlement(Tier::Pro, EntitlementStatus::Active, QuotaLimit::Limited(10), 10))
            .await;
        store.set_latency(Duration::from_millis(200));
        let store_dyn: Arc<dyn EntitlementStore> = store;
        let gate = QuotaGate::new(
            store_dyn.clone(),
            RateLimiter::per_minute(store_dyn, 0),
            redirects(),
            Duration::from_millis(20),
        );

        let decision = gate.check_and_reserve("user-1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::Unavailable));
    }
}
