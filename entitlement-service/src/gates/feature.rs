use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::{DenyReason, FeatureDecision, Redirects};
use crate::models::{Entitlement, Tier};
use crate::services::{record_feature_decision, with_timeout, EntitlementStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Reports,
    Swot,
    Audio,
    Mindmap,
    Podcast,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown feature '{0}'")]
pub struct UnknownFeature(pub String);

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Reports => "reports",
            Feature::Swot => "swot",
            Feature::Audio => "audio",
            Feature::Mindmap => "mindmap",
            Feature::Podcast => "podcast",
        }
    }

    /// Static tier→feature matrix.
    pub fn included_in(&self, tier: Tier) -> bool {
        match tier {
            Tier::Free => matches!(self, Feature::Reports),
            Tier::Pro => !matches!(self, Feature::Podcast),
            Tier::Enterprise => true,
        }
    }

    /// Whether `entitlement` grants this feature right now.
    pub fn evaluate(&self, entitlement: &Entitlement) -> Result<(), DenyReason> {
        if !self.included_in(entitlement.tier) {
            return Err(DenyReason::FeatureNotEntitled);
        }
        if entitlement.tier != Tier::Free && !entitlement.status.is_in_good_standing() {
            return Err(DenyReason::SubscriptionInactive);
        }
        Ok(())
    }
}

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reports" => Ok(Feature::Reports),
            "swot" => Ok(Feature::Swot),
            "audio" => Ok(Feature::Audio),
            "mindmap" => Ok(Feature::Mindmap),
            "podcast" => Ok(Feature::Podcast),
            _ => Err(UnknownFeature(s.to_string())),
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct FeatureGate {
    store: Arc<dyn EntitlementStore>,
    redirects: Redirects,
    timeout: Duration,
}

impl FeatureGate {
    pub fn new(store: Arc<dyn EntitlementStore>, redirects: Redirects, timeout: Duration) -> Self {
        Self {
            store,
            redirects,
            timeout,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn is_allowed(&self, user_id: &str, feature: Feature) -> FeatureDecision {
        let decision = match with_timeout(
            "get_entitlement",
            self.timeout,
            self.store.get_entitlement(user_id),
        )
        .await
        {
            Ok(Some(entitlement)) => match feature.evaluate(&entitlement) {
                Ok(()) => FeatureDecision::allowed(entitlement.tier),
                Err(reason) => {
                    FeatureDecision::denied(reason, Some(entitlement.tier), &self.redirects)
                }
            },
            Ok(None) => FeatureDecision::denied(DenyReason::ProfileNotFound, None, &self.redirects),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Entitlement lookup failed");
                FeatureDecision::denied(DenyReason::Unavailable, None, &self.redirects)
            }
        };

        let reason = decision.reason.map(|r| r.as_str()).unwrap_or("none");
        record_feature_decision(feature.as_str(), decision.allowed, reason);
        info!(
            user_id = %user_id,
            feature = %feature,
            allowed = decision.allowed,
            reason = reason,
            "Feature decision"
        );
        decision
    }
}
