//! Immutable price→tier and tier→quota tables.

use std::collections::HashMap;

use crate::models::{QuotaLimit, Tier};

/// Quota limit per tier for one billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub free: QuotaLimit,
    pub pro: QuotaLimit,
    pub enterprise: QuotaLimit,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: QuotaLimit::Limited(1),
            pro: QuotaLimit::Limited(10),
            enterprise: QuotaLimit::Unlimited,
        }
    }
}

/// Built once at startup from configuration and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct TierTable {
    prices: HashMap<String, Tier>,
    limits: TierLimits,
}

impl TierTable {
    pub fn new<P, E>(pro_prices: P, enterprise_prices: E, limits: TierLimits) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let mut prices = HashMap::new();
        for price in pro_prices {
            prices.insert(price.into(), Tier::Pro);
        }
        // A price listed under both tiers resolves to the higher one.
        for price in enterprise_prices {
            prices.insert(price.into(), Tier::Enterprise);
        }
        Self { prices, limits }
    }

    /// Tier for a processor price id. Unknown or missing prices map to free.
    pub fn tier_for_price(&self, price_id: Option<&str>) -> Tier {
        price_id
            .and_then(|id| self.prices.get(id).copied())
            .unwrap_or(Tier::Free)
    }

    pub fn limit_for(&self, tier: Tier) -> QuotaLimit {
        match tier {
            Tier::Free => self.limits.free,
            Tier::Pro => self.limits.pro,
            Tier::Enterprise => self.limits.enterprise,
        }
    }

    pub fn free_limit(&self) -> QuotaLimit {
        self.limits.free
    }

    pub fn known_prices(&self) -> usize {
        self.prices.len()
    }
}
