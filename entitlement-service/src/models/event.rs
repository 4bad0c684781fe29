//! Processed-event (idempotency ledger) model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What became of a billing event that was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// The event's effect was committed.
    Applied,
    /// Older than the last applied event for the user; ignored.
    Stale,
    /// Event type not handled by this service.
    Ignored,
    /// No user could be resolved for the event.
    Unresolved,
    /// Recognized, but nothing to change (e.g. subscription-mode checkout).
    NoOp,
    /// Seen before; nothing was re-applied.
    Duplicate,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Stale => "stale",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Unresolved => "unresolved",
            EventOutcome::NoOp => "no_op",
            EventOutcome::Duplicate => "duplicate",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "stale" => EventOutcome::Stale,
            "ignored" => EventOutcome::Ignored,
            "unresolved" => EventOutcome::Unresolved,
            "no_op" => EventOutcome::NoOp,
            "duplicate" => EventOutcome::Duplicate,
            _ => EventOutcome::Applied,
        }
    }
}

impl std::fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub outcome: EventOutcome,
    pub processed_at: DateTime<Utc>,
}
