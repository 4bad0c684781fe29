//! Inbound billing processor webhooks.

pub mod event;
mod handler;
mod ingest;
mod verifier;

pub use event::{BillingEvent, EventKind, EventParseError};
pub use handler::{billing_webhook, WebhookResponse};
pub use ingest::{IngestOutcome, WebhookError, WebhookProcessor};
pub use verifier::{WebhookVerifier, SIGNATURE_HEADER};
