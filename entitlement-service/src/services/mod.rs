//! Services module for entitlement-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod rate_limit;
pub mod retention;
pub mod store;

use std::future::Future;
use std::time::Duration;

use service_core::error::AppError;

pub use database::Database;
pub use memory::MemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_feature_decision, record_grpc_request,
    record_grpc_request_duration, record_pruned_rows, record_quota_decision,
    record_resolution_failure, record_store_timeout, record_webhook_event,
};
pub use rate_limit::{RateDecision, RateLimiter};
pub use retention::{prune_once, spawn_prune_task};
pub use store::{CommitOutcome, EntitlementStore, EventRef, PruneStats, Reservation};

/// Run a store call under `timeout`, turning expiry into `AppError::Timeout`.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            record_store_timeout(operation);
            tracing::warn!(
                operation = operation,
                timeout_ms = timeout.as_millis() as u64,
                "Store call timed out"
            );
            Err(AppError::Timeout(format!(
                "{} exceeded {}ms",
                operation,
                timeout.as_millis()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_call_becomes_timeout() {
        let result: Result<(), AppError> = with_timeout(
            "get_entitlement",
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let value = with_timeout("get_entitlement", Duration::from_secs(1), async {
            Ok::<_, AppError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
