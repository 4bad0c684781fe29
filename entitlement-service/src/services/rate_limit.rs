//! Fixed-window rate limiting backed by the shared store counter, so every
//! instance sees the same count.

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use service_core::error::AppError;

use crate::services::store::EntitlementStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn EntitlementStore>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    /// `limit_per_minute = 0` disables limiting.
    pub fn per_minute(store: Arc<dyn EntitlementStore>, limit_per_minute: u32) -> Self {
        Self {
            store,
            limit: limit_per_minute,
            window: Duration::minutes(1),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Count one call for `user_id` under `scope` and decide.
    pub async fn check(
        &self,
        scope: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, AppError> {
        if !self.is_enabled() {
            return Ok(RateDecision::Allowed);
        }

        let window_start = now
            .duration_trunc(self.window)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Invalid rate window: {}", e)))?;
        let expires_at = window_start + self.window;
        let key = format!("{}:{}", scope, user_id);

        let count = self
            .store
            .increment_rate_counter(&key, window_start, expires_at)
            .await?;

        if count > i64::from(self.limit) {
            let retry_after_secs = (expires_at - now).num_seconds().max(1) as u64;
            tracing::debug!(key = %key, count = count, "Rate limit exceeded");
            Ok(RateDecision::Limited { retry_after_secs })
        } else {
            Ok(RateDecision::Allowed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;
    use chrono::TimeZone;

    #[tokio::test]
    async fn limits_after_budget_within_window() {
        let limiter = RateLimiter::per_minute(Arc::new(MemoryStore::new()), 2);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap();

        assert_eq!(
            limiter.check("quota", "user-1", now).await.unwrap(),
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.check("quota", "user-1", now).await.unwrap(),
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.check("quota", "user-1", now).await.unwrap(),
            RateDecision::Limited {
                retry_after_secs: 30
            }
        );

        // Other users and the next window are unaffected.
        assert_eq!(
            limiter.check("quota", "user-2", now).await.unwrap(),
            RateDecision::Allowed
        );
        let next_window = now + Duration::seconds(30);
        assert_eq!(
            limiter.check("quota", "user-1", next_window).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn zero_limit_disables() {
        let limiter = RateLimiter::per_minute(Arc::new(MemoryStore::new()), 0);
        for _ in 0..10 {
            assert_eq!(
                limiter.check("quota", "user-1", Utc::now()).await.unwrap(),
                RateDecision::Allowed
            );
        }
    }
}
