//! Synchronous quota and feature gates.
//!
//! Both gates fail closed: any store error or timeout is a denial with
//! `DenyReason::Unavailable`, never an allow.

mod feature;
mod quota;

pub use feature::{Feature, FeatureGate, UnknownFeature};
pub use quota::{QuotaEvaluation, QuotaGate};

use serde::Serialize;

use crate::models::Tier;

/// Where denied users should be sent. Hints only; the gates never redirect.
#[derive(Debug, Clone)]
pub struct Redirects {
    pub upgrade_url: String,
    pub billing_url: String,
}

impl Redirects {
    fn for_reason(&self, reason: DenyReason) -> Option<String> {
        match reason {
            DenyReason::QuotaExhausted | DenyReason::FeatureNotEntitled => {
                Some(self.upgrade_url.clone())
            }
            DenyReason::SubscriptionInactive => Some(self.billing_url.clone()),
            DenyReason::ProfileNotFound | DenyReason::RateLimited | DenyReason::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    ProfileNotFound,
    SubscriptionInactive,
    QuotaExhausted,
    FeatureNotEntitled,
    RateLimited,
    Unavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::ProfileNotFound => "profile_not_found",
            DenyReason::SubscriptionInactive => "subscription_inactive",
            DenyReason::QuotaExhausted => "quota_exhausted",
            DenyReason::FeatureNotEntitled => "feature_not_entitled",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::Unavailable => "unavailable",
        }
    }

    /// User-facing text.
    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::ProfileNotFound => "no entitlement found for this user",
            DenyReason::SubscriptionInactive => "subscription is not active",
            DenyReason::QuotaExhausted => "no analyses remaining",
            DenyReason::FeatureNotEntitled => "feature is not included in your plan",
            DenyReason::RateLimited => "too many requests, try again shortly",
            DenyReason::Unavailable => "entitlements are temporarily unavailable",
        }
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            DenyReason::ProfileNotFound => 1,
            DenyReason::SubscriptionInactive => 2,
            DenyReason::QuotaExhausted => 3,
            DenyReason::FeatureNotEntitled => 4,
            DenyReason::RateLimited => 5,
            DenyReason::Unavailable => 6,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub tier: Option<Tier>,
    /// Remaining after the reservation. `None` when unlimited or unknown.
    pub remaining: Option<i32>,
    pub unlimited: bool,
    pub reason: Option<DenyReason>,
    pub redirect: Option<String>,
}

impl QuotaDecision {
    fn reserved(tier: Tier, remaining: i32) -> Self {
        Self {
            allowed: true,
            tier: Some(tier),
            remaining: Some(remaining),
            unlimited: false,
            reason: None,
            redirect: None,
        }
    }

    fn unlimited(tier: Tier) -> Self {
        Self {
            allowed: true,
            tier: Some(tier),
            remaining: None,
            unlimited: true,
            reason: None,
            redirect: None,
        }
    }

    fn denied(reason: DenyReason, tier: Option<Tier>, redirects: &Redirects) -> Self {
        Self {
            allowed: false,
            tier,
            remaining: None,
            unlimited: false,
            reason: Some(reason),
            redirect: redirects.for_reason(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureDecision {
    pub allowed: bool,
    pub tier: Option<Tier>,
    pub reason: Option<DenyReason>,
    pub redirect: Option<String>,
}

impl FeatureDecision {
    fn allowed(tier: Tier) -> Self {
        Self {
            allowed: true,
            tier: Some(tier),
            reason: None,
            redirect: None,
        }
    }

    fn denied(reason: DenyReason, tier: Option<Tier>, redirects: &Redirects) -> Self {
        Self {
            allowed: false,
            tier,
            reason: Some(reason),
            redirect: redirects.for_reason(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redirects() -> Redirects {
        Redirects {
            upgrade_url: "/pricing".to_string(),
            billing_url: "/account/billing".to_string(),
        }
    }

    #[test]
    fn upgrade_hint_for_missing_entitlement() {
        let decision = QuotaDecision::denied(DenyReason::QuotaExhausted, Some(Tier::Free), &redirects());
        assert_eq!(decision.redirect.as_deref(), Some("/pricing"));
        assert_eq!(decision.reason.unwrap().message(), "no analyses remaining");
    }

    #[test]
    fn billing_hint_for_inactive_subscription() {
        let decision =
            FeatureDecision::denied(DenyReason::SubscriptionInactive, Some(Tier::Pro), &redirects());
        assert_eq!(decision.redirect.as_deref(), Some("/account/billing"));
    }

    #[test]
    fn no_hint_when_unavailable() {
        let decision = QuotaDecision::denied(DenyReason::Unavailable, None, &redirects());
        assert!(decision.redirect.is_none());
    }
}
