//! Subscription model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EntitlementStatus;

/// Local mirror of a processor subscription, keyed by its external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub user_id: String,
    pub customer_id: Option<String>,
    /// Raw processor status (`active`, `past_due`, `incomplete`, ...).
    pub status: String,
    pub price_id: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    /// Processor-side creation time; decides which live row is authoritative.
    pub created_at: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn entitlement_status(&self) -> EntitlementStatus {
        EntitlementStatus::from_processor(&self.status)
    }

    /// Active, trialing or past due: a row that can still drive entitlement.
    pub fn is_live(&self) -> bool {
        matches!(
            self.entitlement_status(),
            EntitlementStatus::Active | EntitlementStatus::Trialing | EntitlementStatus::PastDue
        )
    }
}

/// Pick the authoritative subscription among a user's rows: the most recently
/// created live one.
pub fn authoritative<'a, I>(subscriptions: I) -> Option<&'a Subscription>
where
    I: IntoIterator<Item = &'a Subscription>,
{
    subscriptions
        .into_iter()
        .filter(|s| s.is_live())
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.subscription_id.cmp(&b.subscription_id))
        })
}
