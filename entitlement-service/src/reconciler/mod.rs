//! Folding verified billing events into entitlement state.

mod handlers;
mod plan;
mod resolution;
mod tiers;

pub use handlers::{
    invoice_drives_entitlement, plan_checkout_credit, plan_invoice_paid, plan_invoice_payment_failed,
    plan_subscription_change, plan_subscription_deleted, subscription_row, ReconcileError,
    Reconciler, Reconciliation,
};
pub use plan::{EntitlementPatch, QuotaChange, ReconcilePlan, Staleness};
pub use resolution::{ResolutionHints, UserResolution, UserResolver, USER_ID_METADATA_KEY};
pub use tiers::{TierLimits, TierTable};
