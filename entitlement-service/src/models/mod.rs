//! Domain models for entitlement-service.

mod entitlement;
mod event;
mod subscription;
mod usage;

pub use entitlement::{Entitlement, EntitlementStatus, QuotaLimit, Tier};
pub use event::{EventOutcome, ProcessedEvent};
pub use subscription::{authoritative, Subscription};
pub use usage::{RecordUsage, UsageRecord, UsageType};
