//! Webhook ingestion: verify, parse, deduplicate, reconcile, commit.

use std::sync::Arc;
use std::time::Duration;

use service_core::error::AppError;
use service_core::utils::SignatureError;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::EventOutcome;
use crate::reconciler::{ReconcileError, Reconciler, Reconciliation};
use crate::services::{
    record_error, record_resolution_failure, record_webhook_event, with_timeout, CommitOutcome,
    EntitlementStore, EventRef,
};
use crate::webhooks::event::{BillingEvent, EventParseError};
use crate::webhooks::verifier::WebhookVerifier;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("signature verification failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed event: {0}")]
    Malformed(#[from] EventParseError),

    #[error("store unavailable: {0}")]
    Store(#[from] AppError),
}

/// What happened to one acknowledged delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub event_id: String,
    pub event_type: String,
    pub outcome: EventOutcome,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    verifier: WebhookVerifier,
    reconciler: Reconciler,
    store: Arc<dyn EntitlementStore>,
    timeout: Duration,
}

impl WebhookProcessor {
    pub fn new(
        verifier: WebhookVerifier,
        reconciler: Reconciler,
        store: Arc<dyn EntitlementStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            reconciler,
            store,
            timeout,
        }
    }

    /// Handle one delivery. `Ok` means the processor should stop retrying;
    /// `Err` carries whether a retry could help.
    pub async fn process(
        &self,
        signature: Option<&str>,
        body: &str,
    ) -> Result<IngestOutcome, WebhookError> {
        if let Err(e) = self.verifier.verify(signature, body) {
            warn!(error = %e, "Rejected webhook signature");
            record_webhook_event("unknown", "rejected");
            return Err(e.into());
        }

        let event = BillingEvent::parse(body).map_err(|e| {
            warn!(error = %e, "Rejected malformed webhook");
            record_webhook_event("unknown", "malformed");
            e
        })?;

        match self.ingest(&event).await {
            Ok(outcome) => {
                record_webhook_event(&event.event_type, outcome.as_str());
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = %outcome,
                    "Webhook processed"
                );
                Ok(IngestOutcome {
                    event_id: event.id,
                    event_type: event.event_type,
                    outcome,
                })
            }
            Err(e) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed; delivery will be retried"
                );
                record_webhook_event(&event.event_type, "error");
                record_error("store", "webhook");
                Err(e.into())
            }
        }
    }

    async fn ingest(&self, event: &BillingEvent) -> Result<EventOutcome, AppError> {
        let event_ref = EventRef {
            event_id: &event.id,
            event_type: &event.event_type,
        };

        let processed = with_timeout(
            "get_processed_event",
            self.timeout,
            self.store.get_processed_event(&event.id),
        )
        .await?;
        if let Some(prior) = processed {
            info!(
                event_id = %event.id,
                prior_outcome = %prior.outcome,
                "Duplicate delivery"
            );
            return Ok(EventOutcome::Duplicate);
        }

        match self.reconciler.reconcile(event).await {
            Ok(Reconciliation::Apply(plan)) => {
                let committed = with_timeout(
                    "commit_plan",
                    self.timeout,
                    self.store.commit_plan(event_ref, &plan),
                )
                .await?;
                Ok(match committed {
                    CommitOutcome::Applied => EventOutcome::Applied,
                    CommitOutcome::Stale => {
                        info!(event_id = %event.id, created = %event.created, "Stale event skipped");
                        EventOutcome::Stale
                    }
                    CommitOutcome::Duplicate => EventOutcome::Duplicate,
                })
            }
            Ok(Reconciliation::Skip(outcome)) => self.record(event_ref, outcome).await,
            Err(ReconcileError::UserResolutionFailed { .. }) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Could not resolve a user for billing event"
                );
                record_resolution_failure(&event.event_type);
                self.record(event_ref, EventOutcome::Unresolved).await
            }
            Err(ReconcileError::Store(e)) => Err(e),
        }
    }

    async fn record(
        &self,
        event: EventRef<'_>,
        outcome: EventOutcome,
    ) -> Result<EventOutcome, AppError> {
        let inserted = with_timeout(
            "record_event",
            self.timeout,
            self.store.record_event(event, outcome),
        )
        .await?;
        Ok(if inserted {
            outcome
        } else {
            EventOutcome::Duplicate
        })
    }
}
