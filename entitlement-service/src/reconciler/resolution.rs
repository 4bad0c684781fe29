//! Mapping a billing event to the user it concerns.
//!
//! Two steps, in order: identifiers the application stamped on the event
//! (metadata, checkout reference, the subscription row an invoice belongs to),
//! then a lookup by processor customer id. The result records which step won.

use std::time::Duration;

use service_core::error::AppError;

use crate::services::{with_timeout, EntitlementStore};

pub const USER_ID_METADATA_KEY: &str = "user_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserResolution {
    ResolvedByMetadata(String),
    ResolvedBySubscription(String),
    ResolvedByCustomerLookup(String),
    Unresolved,
}

impl UserResolution {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            UserResolution::ResolvedByMetadata(id)
            | UserResolution::ResolvedBySubscription(id)
            | UserResolution::ResolvedByCustomerLookup(id) => Some(id),
            UserResolution::Unresolved => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            UserResolution::ResolvedByMetadata(_) => "metadata",
            UserResolution::ResolvedBySubscription(_) => "subscription",
            UserResolution::ResolvedByCustomerLookup(_) => "customer_lookup",
            UserResolution::Unresolved => "unresolved",
        }
    }
}

/// Identifiers pulled from an event payload.
#[derive(Debug, Clone, Default)]
pub struct ResolutionHints<'a> {
    /// First non-empty wins.
    pub direct_user_ids: Vec<Option<&'a str>>,
    pub subscription_id: Option<&'a str>,
    pub customer_id: Option<&'a str>,
}

pub struct UserResolver<'a> {
    store: &'a dyn EntitlementStore,
    timeout: Duration,
}

impl<'a> UserResolver<'a> {
    pub fn new(store: &'a dyn EntitlementStore, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn resolve(&self, hints: &ResolutionHints<'_>) -> Result<UserResolution, AppError> {
        if let Some(user_id) = hints
            .direct_user_ids
            .iter()
            .flatten()
            .map(|id| id.trim())
            .find(|id| !id.is_empty())
        {
            return Ok(UserResolution::ResolvedByMetadata(user_id.to_string()));
        }

        if let Some(subscription_id) = non_empty(hints.subscription_id) {
            let row = with_timeout(
                "get_subscription",
                self.timeout,
                self.store.get_subscription(subscription_id),
            )
            .await?;
            if let Some(row) = row {
                return Ok(UserResolution::ResolvedBySubscription(row.user_id));
            }
        }

        let Some(customer_id) = non_empty(hints.customer_id) else {
            return Ok(UserResolution::Unresolved);
        };

        let entitlement = with_timeout(
            "find_entitlement_by_customer",
            self.timeout,
            self.store.find_entitlement_by_customer(customer_id),
        )
        .await?;
        if let Some(entitlement) = entitlement {
            return Ok(UserResolution::ResolvedByCustomerLookup(entitlement.user_id));
        }

        let subscription = with_timeout(
            "find_subscription_by_customer",
            self.timeout,
            self.store.find_subscription_by_customer(customer_id),
        )
        .await?;

        Ok(subscription
            .map(|s| UserResolution::ResolvedByCustomerLookup(s.user_id))
            .unwrap_or(UserResolution::Unresolved))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entitlement, QuotaLimit, Subscription};
    use crate::services::MemoryStore;
    use chrono::Utc;

    fn timeout() -> Duration {
        Duration::from_secs(1)
    }

    fn subscription(id: &str, user_id: &str, customer_id: &str) -> Subscription {
        Subscription {
            subscription_id: id.to_string(),
            user_id: user_id.to_string(),
            customer_id: Some(customer_id.to_string()),
            status: "active".to_string(),
            price_id: None,
            period_start: None,
            period_end: None,
            cancel_at_period_end: false,
            created_at: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn metadata_wins_without_store_access() {
        let store = MemoryStore::new();
        let resolver = UserResolver::new(&store, timeout());
        let hints = ResolutionHints {
            direct_user_ids: vec![None, Some(" "), Some("user-1")],
            customer_id: Some("cus_1"),
            ..Default::default()
        };

        assert_eq!(
            resolver.resolve(&hints).await.unwrap(),
            UserResolution::ResolvedByMetadata("user-1".to_string())
        );
    }

    #[tokio::test]
    async fn invoice_subscription_row_precedes_customer_lookup() {
        let store = MemoryStore::new();
        store
            .put_subscription(subscription("sub_1", "user-sub", "cus_1"))
            .await;
        let mut other = Entitlement::new_free("user-customer", QuotaLimit::Limited(1), Utc::now());
        other.external_customer_id = Some("cus_1".to_string());
        store.put_entitlement(other).await;

        let resolver = UserResolver::new(&store, timeout());
        let hints = ResolutionHints {
            subscription_id: Some("sub_1"),
            customer_id: Some("cus_1"),
            ..Default::default()
        };

        assert_eq!(
            resolver.resolve(&hints).await.unwrap(),
            UserResolution::ResolvedBySubscription("user-sub".to_string())
        );
    }

    #[tokio::test]
    async fn customer_lookup_falls_back_to_subscriptions() {
        let store = MemoryStore::new();
        store
            .put_subscription(subscription("sub_1", "user-2", "cus_2"))
            .await;

        let resolver = UserResolver::new(&store, timeout());
        let hints = ResolutionHints {
            customer_id: Some("cus_2"),
            ..Default::default()
        };

        let resolution = resolver.resolve(&hints).await.unwrap();
        assert_eq!(resolution.user_id(), Some("user-2"));
        assert_eq!(resolution.method(), "customer_lookup");
    }

    #[tokio::test]
    async fn nothing_to_go_on_is_unresolved() {
        let store = MemoryStore::new();
        let resolver = UserResolver::new(&store, timeout());
        let hints = ResolutionHints {
            customer_id: Some("cus_unknown"),
            ..Default::default()
        };

        assert_eq!(
            resolver.resolve(&hints).await.unwrap(),
            UserResolution::Unresolved
        );
    }
}
