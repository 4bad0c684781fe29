//! Per-event reconciliation.
//!
//! The `plan_*` functions are pure: given the current rows and the payload,
//! they return the plan to commit. `Reconciler` loads the rows, resolves the
//! user and picks the function.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use service_core::error::AppError;
use thiserror::Error;

use super::plan::{EntitlementPatch, QuotaChange, ReconcilePlan, Staleness};
use super::resolution::{ResolutionHints, UserResolution, UserResolver, USER_ID_METADATA_KEY};
use super::tiers::TierTable;
use crate::models::{
    authoritative, Entitlement, EntitlementStatus, EventOutcome, RecordUsage, Subscription, Tier,
    UsageType,
};
use crate::services::{with_timeout, EntitlementStore};
use crate::webhooks::event::{
    BillingEvent, CheckoutMode, CheckoutSession, EventKind, InvoiceObject, SubscriptionObject,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no user could be resolved for {event_type} event {event_id}")]
    UserResolutionFailed { event_id: String, event_type: String },

    #[error(transparent)]
    Store(#[from] AppError),
}

/// What the reconciler decided for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Apply(ReconcilePlan),
    /// Nothing to change; record the event with this outcome.
    Skip(EventOutcome),
}

/// Upserted subscription row for `object`, keeping the creation time of a
/// previously stored row when the payload omits it.
pub fn subscription_row(
    user_id: &str,
    object: &SubscriptionObject,
    existing: Option<&Subscription>,
    event_created: DateTime<Utc>,
) -> Subscription {
    let (period_start, period_end) = object.period();
    Subscription {
        subscription_id: object.id.clone(),
        user_id: user_id.to_string(),
        customer_id: object
            .customer_id()
            .map(str::to_string)
            .or_else(|| existing.and_then(|s| s.customer_id.clone())),
        status: object.status.clone(),
        price_id: object
            .price_id()
            .map(str::to_string)
            .or_else(|| existing.and_then(|s| s.price_id.clone())),
        period_start,
        period_end,
        cancel_at_period_end: object.cancel_at_period_end,
        created_at: object
            .created_at()
            .or_else(|| existing.map(|s| s.created_at))
            .unwrap_or(event_created),
        updated_utc: event_created,
    }
}

/// Whether `row` would be the user's authoritative subscription once upserted
/// among `others`, or no live subscription would remain at all.
fn drives_entitlement(row: &Subscription, others: &[Subscription]) -> bool {
    let merged: Vec<Subscription> = others
        .iter()
        .filter(|s| s.subscription_id != row.subscription_id)
        .cloned()
        .chain(std::iter::once(row.clone()))
        .collect();

    match authoritative(&merged) {
        Some(winner) => winner.subscription_id == row.subscription_id,
        None => true,
    }
}

/// Whether an invoice for `subscription_id` may touch the entitlement: its
/// subscription is the authoritative one, or no live subscription is stored.
pub fn invoice_drives_entitlement(subscription_id: &str, subscriptions: &[Subscription]) -> bool {
    match authoritative(subscriptions) {
        Some(winner) => winner.subscription_id == subscription_id,
        None => true,
    }
}

/// `customer.subscription.created` / `.updated`.
///
/// Tier and limit follow the price; remaining quota is left alone until the
/// next paid invoice.
pub fn plan_subscription_change(
    tiers: &TierTable,
    user_id: &str,
    object: &SubscriptionObject,
    event_created: DateTime<Utc>,
    subscriptions: &[Subscription],
) -> ReconcilePlan {
    let existing = subscriptions
        .iter()
        .find(|s| s.subscription_id == object.id);
    let row = subscription_row(user_id, object, existing, event_created);

    let patch = drives_entitlement(&row, subscriptions).then(|| {
        let tier = tiers.tier_for_price(row.price_id.as_deref());
        EntitlementPatch {
            tier: Some(tier),
            status: Some(row.entitlement_status()),
            quota_limit: Some(tiers.limit_for(tier)),
            period: Some((row.period_start, row.period_end)),
            external_customer_id: row.customer_id.clone(),
            external_subscription_id: Some(Some(row.subscription_id.clone())),
            quota: QuotaChange::Keep,
        }
    });

    ReconcilePlan {
        user_id: user_id.to_string(),
        patch,
        subscription: Some(row),
        usage: None,
        staleness: Staleness::Enforce(event_created),
    }
}

/// `customer.subscription.deleted`: back to free, canceled, quota clamped.
pub fn plan_subscription_deleted(
    tiers: &TierTable,
    user_id: &str,
    object: &SubscriptionObject,
    event_created: DateTime<Utc>,
    subscriptions: &[Subscription],
) -> ReconcilePlan {
    let existing = subscriptions
        .iter()
        .find(|s| s.subscription_id == object.id);
    let mut row = subscription_row(user_id, object, existing, event_created);
    if row.is_live() {
        row.status = "canceled".to_string();
    }

    let patch = drives_entitlement(&row, subscriptions).then(|| EntitlementPatch {
        tier: Some(Tier::Free),
        status: Some(EntitlementStatus::Canceled),
        quota_limit: Some(tiers.free_limit()),
        external_subscription_id: Some(None),
        quota: QuotaChange::ClampToLimit,
        ..Default::default()
    });

    ReconcilePlan {
        user_id: user_id.to_string(),
        patch,
        subscription: Some(row),
        usage: None,
        staleness: Staleness::Enforce(event_created),
    }
}

/// `invoice.paid`: active, and the only event that refills quota.
pub fn plan_invoice_paid(
    tiers: &TierTable,
    current: &Entitlement,
    invoice: &InvoiceObject,
    event_created: DateTime<Utc>,
    subscription: Option<&Subscription>,
) -> ReconcilePlan {
    let tier = subscription
        .and_then(|s| s.price_id.as_deref())
        .or_else(|| invoice.price_id())
        .map(|price| tiers.tier_for_price(Some(price)))
        .unwrap_or(current.tier);

    ReconcilePlan {
        user_id: current.user_id.clone(),
        patch: Some(EntitlementPatch {
            tier: Some(tier),
            status: Some(EntitlementStatus::Active),
            quota_limit: Some(tiers.limit_for(tier)),
            external_customer_id: invoice.customer_id().map(str::to_string),
            quota: QuotaChange::ResetToLimit,
            ..Default::default()
        }),
        subscription: None,
        usage: None,
        staleness: Staleness::Enforce(event_created),
    }
}

/// `invoice.payment_failed`: past due, quota untouched.
pub fn plan_invoice_payment_failed(
    user_id: &str,
    event_created: DateTime<Utc>,
) -> ReconcilePlan {
    ReconcilePlan {
        user_id: user_id.to_string(),
        patch: Some(EntitlementPatch {
            status: Some(EntitlementStatus::PastDue),
            ..Default::default()
        }),
        subscription: None,
        usage: None,
        staleness: Staleness::Enforce(event_created),
    }
}

/// `checkout.session.completed` in payment mode: one purchased analysis.
/// Credits are not ordered against subscription events.
pub fn plan_checkout_credit(user_id: &str, session: &CheckoutSession) -> ReconcilePlan {
    ReconcilePlan {
        user_id: user_id.to_string(),
        patch: Some(EntitlementPatch {
            external_customer_id: session.customer_id().map(str::to_string),
            quota: QuotaChange::Credit(1),
            ..Default::default()
        }),
        subscription: None,
        usage: Some(RecordUsage {
            user_id: user_id.to_string(),
            subscription_id: None,
            usage_type: UsageType::CreditPurchased,
            quantity: 1,
            metadata: Some(json!({
                "checkout_session_id": session.id,
                "amount_total": session.amount_total,
                "currency": session.currency,
            })),
        }),
        staleness: Staleness::Skip,
    }
}

/// Folds billing events into entitlement plans.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn EntitlementStore>,
    tiers: Arc<TierTable>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EntitlementStore>, tiers: Arc<TierTable>, timeout: Duration) -> Self {
        Self {
            store,
            tiers,
            timeout,
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn reconcile(&self, event: &BillingEvent) -> Result<Reconciliation, ReconcileError> {
        match &event.kind {
            EventKind::SubscriptionCreated(object) | EventKind::SubscriptionUpdated(object) => {
                let user_id = self.resolve(event, subscription_hints(object)).await?;
                let (_, subscriptions) = self.prepare(&user_id).await?;
                Ok(Reconciliation::Apply(plan_subscription_change(
                    &self.tiers,
                    &user_id,
                    object,
                    event.created,
                    &subscriptions,
                )))
            }
            EventKind::SubscriptionDeleted(object) => {
                let user_id = self.resolve(event, subscription_hints(object)).await?;
                let (_, subscriptions) = self.prepare(&user_id).await?;
                Ok(Reconciliation::Apply(plan_subscription_deleted(
                    &self.tiers,
                    &user_id,
                    object,
                    event.created,
                    &subscriptions,
                )))
            }
            EventKind::InvoicePaid(invoice) | EventKind::InvoicePaymentFailed(invoice) => {
                let Some(subscription_id) = invoice.subscription_id() else {
                    tracing::info!(invoice_id = %invoice.id, "Invoice not tied to a subscription");
                    return Ok(Reconciliation::Skip(EventOutcome::NoOp));
                };
                let user_id = self.resolve(event, invoice_hints(invoice)).await?;
                let (current, subscriptions) = self.prepare(&user_id).await?;

                if !invoice_drives_entitlement(subscription_id, &subscriptions) {
                    tracing::info!(
                        invoice_id = %invoice.id,
                        subscription_id = %subscription_id,
                        "Invoice belongs to a superseded subscription"
                    );
                    return Ok(Reconciliation::Skip(EventOutcome::NoOp));
                }

                if matches!(event.kind, EventKind::InvoicePaymentFailed(_)) {
                    return Ok(Reconciliation::Apply(plan_invoice_payment_failed(
                        &user_id,
                        event.created,
                    )));
                }

                let subscription = subscriptions
                    .iter()
                    .find(|s| s.subscription_id == subscription_id);
                Ok(Reconciliation::Apply(plan_invoice_paid(
                    &self.tiers,
                    &current,
                    invoice,
                    event.created,
                    subscription,
                )))
            }
            EventKind::CheckoutSessionCompleted(session) => {
                if session.mode != CheckoutMode::Payment {
                    tracing::debug!(
                        session_id = %session.id,
                        mode = ?session.mode,
                        "Non-payment checkout awaits its subscription events"
                    );
                    return Ok(Reconciliation::Skip(EventOutcome::NoOp));
                }
                let user_id = self.resolve(event, checkout_hints(session)).await?;
                with_timeout(
                    "ensure_entitlement",
                    self.timeout,
                    self.store
                        .ensure_entitlement(&user_id, self.tiers.free_limit()),
                )
                .await?;
                Ok(Reconciliation::Apply(plan_checkout_credit(&user_id, session)))
            }
            EventKind::Unknown => Ok(Reconciliation::Skip(EventOutcome::Ignored)),
        }
    }

    async fn resolve(
        &self,
        event: &BillingEvent,
        hints: ResolutionHints<'_>,
    ) -> Result<String, ReconcileError> {
        let resolution = UserResolver::new(self.store.as_ref(), self.timeout)
            .resolve(&hints)
            .await?;

        tracing::debug!(method = resolution.method(), "User resolution finished");

        match resolution {
            UserResolution::Unresolved => Err(ReconcileError::UserResolutionFailed {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
            }),
            resolved => Ok(resolved.user_id().unwrap_or_default().to_string()),
        }
    }

    /// Make sure the entitlement row exists and load the user's subscriptions.
    async fn prepare(
        &self,
        user_id: &str,
    ) -> Result<(Entitlement, Vec<Subscription>), ReconcileError> {
        let current = with_timeout(
            "ensure_entitlement",
            self.timeout,
            self.store
                .ensure_entitlement(user_id, self.tiers.free_limit()),
        )
        .await?;
        let subscriptions = with_timeout(
            "list_subscriptions",
            self.timeout,
            self.store.list_subscriptions(user_id),
        )
        .await?;
        Ok((current, subscriptions))
    }
}

fn subscription_hints(object: &SubscriptionObject) -> ResolutionHints<'_> {
    ResolutionHints {
        direct_user_ids: vec![object.metadata.get(USER_ID_METADATA_KEY).map(String::as_str)],
        subscription_id: None,
        customer_id: object.customer_id(),
    }
}

fn checkout_hints(session: &CheckoutSession) -> ResolutionHints<'_> {
    ResolutionHints {
        direct_user_ids: vec![
            session.metadata.get(USER_ID_METADATA_KEY).map(String::as_str),
            session.client_reference_id.as_deref(),
        ],
        subscription_id: None,
        customer_id: session.customer_id(),
    }
}

fn invoice_hints(invoice: &InvoiceObject) -> ResolutionHints<'_> {
    ResolutionHints {
        direct_user_ids: vec![invoice.metadata_value(USER_ID_METADATA_KEY)],
        subscription_id: invoice.subscription_id(),
        customer_id: invoice.customer_id(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuotaLimit;
    use crate::reconciler::TierLimits;
    use crate::webhooks::event::{Expandable, List, Price, SubscriptionItem};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn tiers() -> TierTable {
        TierTable::new(["price_pro"], ["price_ent"], TierLimits::default())
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    fn sub_object(id: &str, status: &str, price: &str, created_hour: u32) -> SubscriptionObject {
        SubscriptionObject {
            id: id.to_string(),
            customer: Some(Expandable::Id("cus_1".to_string())),
            status: status.to_string(),
            metadata: HashMap::new(),
            items: List {
                data: vec![SubscriptionItem {
                    price: Some(Price {
                        id: price.to_string(),
                    }),
                    current_period_start: None,
                    current_period_end: None,
                }],
            },
            current_period_start: Some(at(0).timestamp()),
            current_period_end: Some(at(23).timestamp()),
            cancel_at_period_end: false,
            created: Some(at(created_hour).timestamp()),
        }
    }

    fn free_entitlement(remaining: i32) -> Entitlement {
        let mut e = Entitlement::new_free("user-1", QuotaLimit::Limited(1), at(0));
        e.quota_remaining = remaining;
        e
    }

    #[test]
    fn pro_price_sets_tier_and_limit_without_refill() {
        let plan = plan_subscription_change(
            &tiers(),
            "user-1",
            &sub_object("sub_1", "active", "price_pro", 1),
            at(2),
            &[],
        );

        let patch = plan.patch.clone().unwrap();
        assert_eq!(patch.tier, Some(Tier::Pro));
        assert_eq!(patch.quota_limit, Some(QuotaLimit::Limited(10)));
        assert_eq!(patch.quota, QuotaChange::Keep);
        assert_eq!(plan.staleness, Staleness::Enforce(at(2)));

        let next = patch.apply(&free_entitlement(0), at(2));
        assert_eq!(next.quota_remaining, 0);
        assert_eq!(next.status, EntitlementStatus::Active);
        assert_eq!(next.external_subscription_id.as_deref(), Some("sub_1"));
    }

    #[test]
    fn unknown_price_is_free() {
        let plan = plan_subscription_change(
            &tiers(),
            "user-1",
            &sub_object("sub_1", "active", "price_other", 1),
            at(2),
            &[],
        );
        assert_eq!(plan.patch.unwrap().tier, Some(Tier::Free));
    }

    #[test]
    fn older_subscription_does_not_override_newer_one() {
        let newer = subscription_row(
            "user-1",
            &sub_object("sub_new", "active", "price_ent", 5),
            None,
            at(5),
        );
        let plan = plan_subscription_change(
            &tiers(),
            "user-1",
            &sub_object("sub_old", "active", "price_pro", 1),
            at(6),
            &[newer],
        );

        assert!(plan.patch.is_none());
        assert_eq!(plan.subscription.unwrap().subscription_id, "sub_old");
    }

    #[test]
    fn deletion_drops_to_free_and_clamps() {
        let plan = plan_subscription_deleted(
            &tiers(),
            "user-1",
            &sub_object("sub_1", "canceled", "price_pro", 1),
            at(3),
            &[],
        );
        let mut current = free_entitlement(6);
        current.tier = Tier::Pro;
        current.status = EntitlementStatus::Active;
        current.quota_limit = QuotaLimit::Limited(10);
        current.external_subscription_id = Some("sub_1".to_string());

        let next = plan.patch.unwrap().apply(&current, at(3));
        assert_eq!(next.tier, Tier::Free);
        assert_eq!(next.status, EntitlementStatus::Canceled);
        assert_eq!(next.quota_remaining, 1);
        assert_eq!(next.external_subscription_id, None);
    }

    #[test]
    fn deleting_a_secondary_subscription_keeps_entitlement() {
        let primary = subscription_row(
            "user-1",
            &sub_object("sub_primary", "active", "price_pro", 4),
            None,
            at(4),
        );
        let plan = plan_subscription_deleted(
            &tiers(),
            "user-1",
            &sub_object("sub_extra", "active", "price_pro", 1),
            at(5),
            &[primary],
        );
        assert!(plan.patch.is_none());
        assert_eq!(plan.subscription.unwrap().status, "canceled");
    }

    #[test]
    fn invoice_paid_refills_to_tier_limit() {
        let row = subscription_row(
            "user-1",
            &sub_object("sub_1", "active", "price_pro", 1),
            None,
            at(1),
        );
        let invoice = InvoiceObject {
            id: "in_1".to_string(),
            customer: None,
            subscription: Some(Expandable::Id("sub_1".to_string())),
            metadata: HashMap::new(),
            subscription_details: None,
            lines: List::default(),
        };

        let plan = plan_invoice_paid(&tiers(), &free_entitlement(0), &invoice, at(2), Some(&row));
        let next = plan.patch.unwrap().apply(&free_entitlement(0), at(2));
        assert_eq!(next.tier, Tier::Pro);
        assert_eq!(next.status, EntitlementStatus::Active);
        assert_eq!(next.quota_remaining, 10);
    }

    #[test]
    fn invoices_follow_the_authoritative_subscription() {
        let older = subscription_row(
            "user-1",
            &sub_object("sub_old", "active", "price_pro", 1),
            None,
            at(1),
        );
        let newer = subscription_row(
            "user-1",
            &sub_object("sub_new", "active", "price_ent", 2),
            None,
            at(2),
        );
        let rows = [older, newer];

        assert!(invoice_drives_entitlement("sub_new", &rows));
        assert!(!invoice_drives_entitlement("sub_old", &rows));
        assert!(invoice_drives_entitlement("sub_unseen", &[]));

        let ended = subscription_row(
            "user-1",
            &sub_object("sub_old", "canceled", "price_pro", 1),
            None,
            at(1),
        );
        assert!(invoice_drives_entitlement("sub_unseen", &[ended]));
    }

    #[test]
    fn payment_failure_only_changes_status() {
        let plan = plan_invoice_payment_failed("user-1", at(2));
        let mut current = free_entitlement(3);
        current.tier = Tier::Pro;
        current.quota_limit = QuotaLimit::Limited(10);
        current.status = EntitlementStatus::Active;

        let next = plan.patch.unwrap().apply(&current, at(2));
        assert_eq!(next.status, EntitlementStatus::PastDue);
        assert_eq!(next.quota_remaining, 3);
        assert_eq!(next.tier, Tier::Pro);
        assert_eq!(plan.staleness, Staleness::Enforce(at(2)));
    }

    #[test]
    fn checkout_credit_is_unordered_and_ledgered() {
        let session = CheckoutSession {
            id: "cs_1".to_string(),
            mode: CheckoutMode::Payment,
            customer: None,
            client_reference_id: Some("user-1".to_string()),
            metadata: HashMap::new(),
            amount_total: Some(500),
            currency: Some("usd".to_string()),
            payment_status: Some("paid".to_string()),
        };

        let plan = plan_checkout_credit("user-1", &session);
        assert_eq!(plan.staleness, Staleness::Skip);
        let usage = plan.usage.unwrap();
        assert_eq!(usage.usage_type, UsageType::CreditPurchased);
        assert_eq!(usage.metadata.unwrap()["checkout_session_id"], "cs_1");
    }
}
