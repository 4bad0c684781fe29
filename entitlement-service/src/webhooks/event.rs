//! Strict parsing of billing processor events.
//!
//! Every recognized event type is decoded into a typed payload up front;
//! a recognized type whose object does not match its shape is rejected here
//! and never reaches the reconciler.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("event envelope is invalid: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    #[error("{event_type} payload is malformed: {source}")]
    MalformedObject {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// A reference that the processor sends either as a bare id or as the
/// expanded object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Price {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: List<SubscriptionItem>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub created: Option<i64>,
}

impl SubscriptionObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(Expandable::id)
    }

    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .iter()
            .find_map(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// Billing period bounds. Newer API versions carry them on the item
    /// rather than the subscription.
    pub fn period(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let item = self.items.data.first();
        let start = self
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start));
        let end = self
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end));
        (start.and_then(from_unix), end.and_then(from_unix))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created.and_then(from_unix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Payment,
    Subscription,
    Setup,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub mode: CheckoutMode,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
}

impl CheckoutSession {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(Expandable::id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    pub lines: List<InvoiceLine>,
}

impl InvoiceObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(Expandable::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(Expandable::id)
    }

    /// Metadata key lookup across the invoice and its subscription details.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .or_else(|| {
                self.subscription_details
                    .as_ref()
                    .and_then(|d| d.metadata.get(key))
            })
            .map(String::as_str)
    }

    pub fn price_id(&self) -> Option<&str> {
        self.lines
            .data
            .iter()
            .find_map(|line| line.price.as_ref())
            .map(|price| price.id.as_str())
    }
}

/// Typed payload per recognized event type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutSessionCompleted(CheckoutSession),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    Unknown,
}

/// A verified, parsed billing event.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub kind: EventKind,
}

impl BillingEvent {
    pub fn parse(body: &str) -> Result<Self, EventParseError> {
        let envelope: Envelope =
            serde_json::from_str(body).map_err(EventParseError::InvalidEnvelope)?;

        let created =
            from_unix(envelope.created).ok_or(EventParseError::InvalidTimestamp(envelope.created))?;

        let object = envelope.data.object;
        let event_type = envelope.event_type;
        let kind = match event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => {
                EventKind::CheckoutSessionCompleted(decode(&event_type, object)?)
            }
            SUBSCRIPTION_CREATED => EventKind::SubscriptionCreated(decode(&event_type, object)?),
            SUBSCRIPTION_UPDATED => EventKind::SubscriptionUpdated(decode(&event_type, object)?),
            SUBSCRIPTION_DELETED => EventKind::SubscriptionDeleted(decode(&event_type, object)?),
            INVOICE_PAID => EventKind::InvoicePaid(decode(&event_type, object)?),
            INVOICE_PAYMENT_FAILED => EventKind::InvoicePaymentFailed(decode(&event_type, object)?),
            _ => EventKind::Unknown,
        };

        Ok(Self {
            id: envelope.id,
            event_type,
            created,
            kind,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: serde_json::Value,
) -> Result<T, EventParseError> {
    serde_json::from_value(object).map_err(|source| EventParseError::MalformedObject {
        event_type: event_type.to_string(),
        source,
    })
}

pub(crate) fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}
