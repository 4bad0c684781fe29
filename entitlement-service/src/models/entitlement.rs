//! Entitlement model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Service level determining quota and feature access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Parse a stored tier. Unknown values fall back to `Free`, the
    /// conservative choice.
    pub fn from_string(s: &str) -> Self {
        match s {
            "pro" => Tier::Pro,
            "enterprise" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            Tier::Free => 1,
            Tier::Pro => 2,
            Tier::Enterprise => 3,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription status as seen by the gates.
///
/// `None` and `Canceled` gate identically: paid features denied, free-tier
/// consumption allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    None,
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementStatus::None => "none",
            EntitlementStatus::Active => "active",
            EntitlementStatus::Trialing => "trialing",
            EntitlementStatus::PastDue => "past_due",
            EntitlementStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "active" => EntitlementStatus::Active,
            "trialing" => EntitlementStatus::Trialing,
            "past_due" => EntitlementStatus::PastDue,
            "canceled" => EntitlementStatus::Canceled,
            _ => EntitlementStatus::None,
        }
    }

    /// Map a processor subscription status onto ours.
    ///
    /// `unpaid` keeps the customer in dunning like `past_due`; `incomplete`
    /// and `paused` have not (or no longer) paid and grant nothing.
    pub fn from_processor(s: &str) -> Self {
        match s {
            "active" => EntitlementStatus::Active,
            "trialing" => EntitlementStatus::Trialing,
            "past_due" | "unpaid" => EntitlementStatus::PastDue,
            "canceled" | "incomplete_expired" => EntitlementStatus::Canceled,
            _ => EntitlementStatus::None,
        }
    }

    /// Active or trialing: the statuses that unlock paid features.
    pub fn is_in_good_standing(&self) -> bool {
        matches!(self, EntitlementStatus::Active | EntitlementStatus::Trialing)
    }

    /// Statuses under which a paid tier may still spend quota it already holds.
    pub fn permits_consumption(&self) -> bool {
        matches!(
            self,
            EntitlementStatus::Active | EntitlementStatus::Trialing | EntitlementStatus::PastDue
        )
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            EntitlementStatus::None => 1,
            EntitlementStatus::Active => 2,
            EntitlementStatus::Trialing => 3,
            EntitlementStatus::PastDue => 4,
            EntitlementStatus::Canceled => 5,
        }
    }
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota ceiling for a billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLimit {
    Limited(i32),
    Unlimited,
}

impl QuotaLimit {
    /// Sentinel stored in the `quota_limit` column for unlimited tiers.
    pub const UNLIMITED_SENTINEL: i32 = -1;

    pub fn to_db(&self) -> i32 {
        match self {
            QuotaLimit::Limited(n) => *n,
            QuotaLimit::Unlimited => Self::UNLIMITED_SENTINEL,
        }
    }

    pub fn from_db(value: i32) -> Self {
        if value < 0 {
            QuotaLimit::Unlimited
        } else {
            QuotaLimit::Limited(value)
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, QuotaLimit::Unlimited)
    }

    /// The finite limit, if any.
    pub fn limited(&self) -> Option<i32> {
        match self {
            QuotaLimit::Limited(n) => Some(*n),
            QuotaLimit::Unlimited => None,
        }
    }
}

/// Authoritative per-user record of tier, status and remaining quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: String,
    pub tier: Tier,
    pub status: EntitlementStatus,
    pub quota_limit: QuotaLimit,
    pub quota_remaining: i32,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub last_applied_event_ts: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Entitlement {
    /// The row written at signup: free tier, no subscription, full free quota.
    pub fn new_free(user_id: impl Into<String>, free_limit: QuotaLimit, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: Tier::Free,
            status: EntitlementStatus::None,
            quota_limit: free_limit,
            quota_remaining: free_limit.limited().unwrap_or(0),
            period_start: None,
            period_end: None,
            external_customer_id: None,
            external_subscription_id: None,
            last_applied_event_ts: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Whether an event stamped `event_ts` is older than the newest event
    /// already applied to this row.
    pub fn is_stale(&self, event_ts: DateTime<Utc>) -> bool {
        self.last_applied_event_ts
            .map(|last| event_ts < last)
            .unwrap_or(false)
    }
}
