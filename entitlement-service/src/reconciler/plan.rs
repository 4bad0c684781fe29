//! Reconciliation plans: the pure output of an event handler, applied
//! atomically by the store.

use chrono::{DateTime, Utc};

use crate::models::{Entitlement, EntitlementStatus, QuotaLimit, RecordUsage, Subscription, Tier};

/// How a plan moves `quota_remaining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaChange {
    /// Leave remaining quota as it is.
    Keep,
    /// Refill to the (new) limit. Only invoice payment does this.
    ResetToLimit,
    /// Add purchased units on top of whatever remains.
    Credit(i32),
    /// Lower remaining quota to the (new) limit if it exceeds it.
    ClampToLimit,
}

/// Field-level changes to an entitlement row.
///
/// `None` leaves a field untouched. The subscription link uses a nested option
/// so that `Some(None)` clears it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitlementPatch {
    pub tier: Option<Tier>,
    pub status: Option<EntitlementStatus>,
    pub quota_limit: Option<QuotaLimit>,
    pub period: Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<Option<String>>,
    pub quota: QuotaChange,
}

impl Default for EntitlementPatch {
    fn default() -> Self {
        Self {
            tier: None,
            status: None,
            quota_limit: None,
            period: None,
            external_customer_id: None,
            external_subscription_id: None,
            quota: QuotaChange::Keep,
        }
    }
}

impl EntitlementPatch {
    /// Compute the row that results from applying this patch to `current`.
    ///
    /// Both stores use this so the arithmetic lives in one place; the stores
    /// only supply the locked current row and persist the result.
    pub fn apply(&self, current: &Entitlement, now: DateTime<Utc>) -> Entitlement {
        let mut next = current.clone();

        if let Some(tier) = self.tier {
            next.tier = tier;
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(limit) = self.quota_limit {
            next.quota_limit = limit;
        }
        if let Some((start, end)) = self.period {
            next.period_start = start;
            next.period_end = end;
        }
        if let Some(customer) = &self.external_customer_id {
            next.external_customer_id = Some(customer.clone());
        }
        if let Some(link) = &self.external_subscription_id {
            next.external_subscription_id = link.clone();
        }

        next.quota_remaining = match (self.quota, next.quota_limit) {
            (QuotaChange::Keep, _) => current.quota_remaining,
            (QuotaChange::ResetToLimit, QuotaLimit::Limited(limit)) => limit,
            (QuotaChange::ResetToLimit, QuotaLimit::Unlimited) => current.quota_remaining,
            (QuotaChange::Credit(units), _) => current.quota_remaining.saturating_add(units),
            (QuotaChange::ClampToLimit, QuotaLimit::Limited(limit)) => {
                current.quota_remaining.min(limit)
            }
            (QuotaChange::ClampToLimit, QuotaLimit::Unlimited) => current.quota_remaining,
        };

        next.updated_utc = now;
        next
    }
}

/// Whether the plan is gated on event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Reject the plan if `event_ts` predates the row's last applied event, and
    /// advance the watermark on success.
    Enforce(DateTime<Utc>),
    /// Apply regardless of ordering and leave the watermark alone.
    Skip,
}

/// Everything one billing event changes, committed together with the
/// processed-event marker or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub user_id: String,
    pub patch: Option<EntitlementPatch>,
    pub subscription: Option<Subscription>,
    pub usage: Option<RecordUsage>,
    pub staleness: Staleness,
}

impl ReconcilePlan {
    /// New watermark after this plan applies to a row whose watermark is
    /// `current`.
    pub fn next_watermark(&self, current: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self.staleness {
            Staleness::Enforce(ts) => Some(current.map_or(ts, |last| last.max(ts))),
            Staleness::Skip => current,
        }
    }

    /// Whether this plan must be rejected against a row with `current`
    /// watermark.
    pub fn is_stale_against(&self, entitlement: &Entitlement) -> bool {
        match self.staleness {
            Staleness::Enforce(ts) => entitlement.is_stale(ts),
            Staleness::Skip => false,
        }
    }

    /// Fields a stale plan may still fill on `current`: an empty subscription
    /// link, an empty billing period and a missing customer id. Tier, status,
    /// quota and the watermark are left alone. `None` when nothing changes.
    pub fn stale_backfill(&self, current: &Entitlement, now: DateTime<Utc>) -> Option<Entitlement> {
        let patch = self.patch.as_ref()?;
        let Some(Some(link)) = &patch.external_subscription_id else {
            return None;
        };
        if current.external_subscription_id.is_some() {
            return None;
        }

        let mut next = current.clone();
        next.external_subscription_id = Some(link.clone());
        if let Some((start, end)) = patch.period {
            if current.period_start.is_none() && current.period_end.is_none() {
                next.period_start = start;
                next.period_end = end;
            }
        }
        if current.external_customer_id.is_none() {
            next.external_customer_id = patch.external_customer_id.clone();
        }
        next.updated_utc = now;
        Some(next)
    }
}
