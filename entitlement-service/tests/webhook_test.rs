//! Billing webhook integration tests.

mod common;

use std::time::Duration;

use common::{
    checkout_event, invoice_event, invoice_event_with_user, sign, subscription_event, TestApp,
    ENTERPRISE_PRICE, PRO_PRICE,
};
use entitlement_service::models::{
    Entitlement, EntitlementStatus, EventOutcome, QuotaLimit, Tier, UsageType,
};
use entitlement_service::services::EntitlementStore;

const T0: i64 = 1_717_200_000;

#[tokio::test]
async fn missing_signature_is_rejected() {
    let app = TestApp::spawn().await;
    let body = checkout_event("evt_sig_1", T0, "payment", "user-1");

    let response = app.post_webhook_with_signature(&body, None).await;
    assert_eq!(response.status().as_u16(), 400);
    assert!(app.store.get_processed_event("evt_sig_1").await.unwrap().is_none());
}

#[tokio::test]
async fn forged_signature_is_rejected() {
    let app = TestApp::spawn().await;
    let body = checkout_event("evt_sig_2", T0, "payment", "user-1");
    let forged = sign(&checkout_event("evt_other", T0, "payment", "user-1"));

    let response = app.post_webhook_with_signature(&body, Some(&forged)).await;
    assert_eq!(response.status().as_u16(), 400);
    assert!(app.store.get_entitlement("user-1").await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_payload_of_known_type_is_rejected() {
    let app = TestApp::spawn().await;
    let body = serde_json::json!({
        "id": "evt_bad",
        "type": "customer.subscription.updated",
        "created": T0,
        "data": { "object": { "status": "active" } }
    })
    .to_string();

    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn unknown_event_type_is_acknowledged() {
    let app = TestApp::spawn().await;
    let body = serde_json::json!({
        "id": "evt_unknown",
        "type": "customer.created",
        "created": T0,
        "data": { "object": { "id": "cus_1" } }
    })
    .to_string();

    let json = app.deliver(&body).await;
    assert_eq!(json["received"], true);
    assert_eq!(json["outcome"], "ignored");
}

#[tokio::test]
async fn pro_price_derives_tier_and_limit() {
    let app = TestApp::spawn().await;
    let body = subscription_event(
        "evt_created",
        "customer.subscription.created",
        T0,
        "user-pro",
        "sub_pro",
        "active",
        PRO_PRICE,
    );

    let json = app.deliver(&body).await;
    assert_eq!(json["outcome"], "applied");

    let entitlement = app.entitlement("user-pro").await;
    assert_eq!(entitlement.tier, Tier::Pro);
    assert_eq!(entitlement.quota_limit, QuotaLimit::Limited(10));
    assert_eq!(entitlement.status, EntitlementStatus::Active);
    assert_eq!(entitlement.external_customer_id.as_deref(), Some("cus_user-pro"));
    assert_eq!(entitlement.external_subscription_id.as_deref(), Some("sub_pro"));

    let subscription = app.subscription("sub_pro").await.unwrap();
    assert_eq!(subscription.user_id, "user-pro");
    assert_eq!(subscription.price_id.as_deref(), Some(PRO_PRICE));
}

#[tokio::test]
async fn redelivery_is_a_recorded_no_op() {
    let app = TestApp::spawn().await;
    let body = subscription_event(
        "evt_dup",
        "customer.subscription.updated",
        T0,
        "user-dup",
        "sub_dup",
        "active",
        PRO_PRICE,
    );

    assert_eq!(app.deliver(&body).await["outcome"], "applied");
    let entitlement_once = app.entitlement("user-dup").await;
    let subscription_once = app.subscription("sub_dup").await;

    let second = app.deliver(&body).await;
    assert_eq!(second["outcome"], "duplicate");

    assert_eq!(app.entitlement("user-dup").await, entitlement_once);
    assert_eq!(app.subscription("sub_dup").await, subscription_once);

    let marker = app.store.get_processed_event("evt_dup").await.unwrap().unwrap();
    assert_eq!(marker.outcome, EventOutcome::Applied);
}

#[tokio::test]
async fn older_update_does_not_override_newer_state() {
    let app = TestApp::spawn().await;
    let newer = subscription_event(
        "evt_newer",
        "customer.subscription.updated",
        T0 + 600,
        "user-order",
        "sub_order",
        "active",
        PRO_PRICE,
    );
    let older = subscription_event(
        "evt_older",
        "customer.subscription.updated",
        T0,
        "user-order",
        "sub_order",
        "canceled",
        ENTERPRISE_PRICE,
    );

    assert_eq!(app.deliver(&newer).await["outcome"], "applied");
    let before = app.entitlement("user-order").await;

    assert_eq!(app.deliver(&older).await["outcome"], "stale");
    let after = app.entitlement("user-order").await;

    assert_eq!(after.tier, Tier::Pro);
    assert_eq!(after.status, EntitlementStatus::Active);
    assert_eq!(after.quota_limit, QuotaLimit::Limited(10));
    assert_eq!(after.last_applied_event_ts, before.last_applied_event_ts);

    let marker = app.store.get_processed_event("evt_older").await.unwrap().unwrap();
    assert_eq!(marker.outcome, EventOutcome::Stale);
}

#[tokio::test]
async fn cancellation_drops_to_free() {
    let app = TestApp::spawn().await;
    app.deliver(&subscription_event(
        "evt_c1",
        "customer.subscription.created",
        T0,
        "user-cancel",
        "sub_cancel",
        "active",
        PRO_PRICE,
    ))
    .await;
    app.deliver(&invoice_event(
        "evt_c2",
        "invoice.paid",
        T0 + 60,
        "sub_cancel",
        "cus_user-cancel",
    ))
    .await;
    assert_eq!(app.entitlement("user-cancel").await.quota_remaining, 10);

    let json = app
        .deliver(&subscription_event(
            "evt_c3",
            "customer.subscription.deleted",
            T0 + 120,
            "user-cancel",
            "sub_cancel",
            "canceled",
            PRO_PRICE,
        ))
        .await;
    assert_eq!(json["outcome"], "applied");

    let entitlement = app.entitlement("user-cancel").await;
    assert_eq!(entitlement.tier, Tier::Free);
    assert_eq!(entitlement.status, EntitlementStatus::Canceled);
    assert!(entitlement.quota_remaining <= 1);
    assert_eq!(entitlement.external_subscription_id, None);
}

#[tokio::test]
async fn payment_failure_marks_past_due_and_keeps_quota() {
    let app = TestApp::spawn().await;
    app.deliver(&subscription_event(
        "evt_f1",
        "customer.subscription.created",
        T0,
        "user-fail",
        "sub_fail",
        "active",
        PRO_PRICE,
    ))
    .await;
    app.deliver(&invoice_event("evt_f2", "invoice.paid", T0 + 60, "sub_fail", "cus_user-fail"))
        .await;

    let json = app
        .deliver(&invoice_event(
            "evt_f3",
            "invoice.payment_failed",
            T0 + 120,
            "sub_fail",
            "cus_user-fail",
        ))
        .await;
    assert_eq!(json["outcome"], "applied");

    let entitlement = app.entitlement("user-fail").await;
    assert_eq!(entitlement.status, EntitlementStatus::PastDue);
    assert_eq!(entitlement.tier, Tier::Pro);
    assert_eq!(entitlement.quota_remaining, 10);
}

#[tokio::test]
async fn payment_checkout_credits_one_analysis() {
    let app = TestApp::spawn().await;
    let mut seeded = Entitlement::new_free("user-credit", QuotaLimit::Limited(1), chrono::Utc::now());
    seeded.status = EntitlementStatus::Canceled;
    seeded.quota_remaining = 0;
    app.store.put_entitlement(seeded).await;

    let json = app
        .deliver(&checkout_event("evt_credit", T0, "payment", "user-credit"))
        .await;
    assert_eq!(json["outcome"], "applied");

    let entitlement = app.entitlement("user-credit").await;
    assert_eq!(entitlement.quota_remaining, 1);
    assert_eq!(entitlement.status, EntitlementStatus::Canceled);

    let usage = app.store.list_usage("user-credit").await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].usage_type, UsageType::CreditPurchased);
    assert_eq!(usage[0].quantity, 1);
}

#[tokio::test]
async fn subscription_mode_checkout_is_a_no_op() {
    let app = TestApp::spawn().await;
    let json = app
        .deliver(&checkout_event("evt_submode", T0, "subscription", "user-submode"))
        .await;
    assert_eq!(json["outcome"], "no_op");
    assert!(app.store.get_entitlement("user-submode").await.unwrap().is_none());
}

#[tokio::test]
async fn unresolvable_invoice_is_acknowledged() {
    let app = TestApp::spawn().await;
    let json = app
        .deliver(&invoice_event(
            "evt_orphan",
            "invoice.paid",
            T0,
            "sub_unknown",
            "cus_unknown",
        ))
        .await;
    assert_eq!(json["outcome"], "unresolved");
}

#[tokio::test]
async fn invoice_resolves_user_through_customer_lookup() {
    let app = TestApp::spawn().await;
    let mut seeded = Entitlement::new_free("user-lookup", QuotaLimit::Limited(1), chrono::Utc::now());
    seeded.external_customer_id = Some("cus_lookup".to_string());
    app.store.put_entitlement(seeded).await;

    let json = app
        .deliver(&invoice_event(
            "evt_lookup",
            "invoice.payment_failed",
            T0,
            "sub_not_yet_seen",
            "cus_lookup",
        ))
        .await;
    assert_eq!(json["outcome"], "applied");
    assert_eq!(
        app.entitlement("user-lookup").await.status,
        EntitlementStatus::PastDue
    );
}

#[tokio::test]
async fn duplicate_update_leaves_watermark_unchanged() {
    let app = TestApp::spawn().await;
    let body = subscription_event(
        "evt_redeliver",
        "customer.subscription.updated",
        T0,
        "user-redeliver",
        "sub_redeliver",
        "active",
        PRO_PRICE,
    );

    app.deliver(&body).await;
    let watermark = app.entitlement("user-redeliver").await.last_applied_event_ts;
    assert!(watermark.is_some());

    assert_eq!(app.deliver(&body).await["outcome"], "duplicate");
    assert_eq!(app.entitlement("user-redeliver").await.last_applied_event_ts, watermark);
}

#[tokio::test]
async fn quota_resets_only_on_invoice() {
    let app = TestApp::spawn().await;
    let mut seeded = Entitlement::new_free("user-refill", QuotaLimit::Limited(1), chrono::Utc::now());
    seeded.quota_remaining = 0;
    app.store.put_entitlement(seeded).await;

    app.deliver(&subscription_event(
        "evt_refill_update",
        "customer.subscription.updated",
        T0,
        "user-refill",
        "sub_refill",
        "active",
        PRO_PRICE,
    ))
    .await;

    let after_update = app.entitlement("user-refill").await;
    assert_eq!(after_update.tier, Tier::Pro);
    assert_eq!(after_update.quota_limit, QuotaLimit::Limited(10));
    assert_eq!(after_update.quota_remaining, 0);

    app.deliver(&invoice_event("evt_refill_paid", "invoice.paid", T0 + 60, "sub_refill", "cus_user-refill"))
        .await;
    assert_eq!(app.entitlement("user-refill").await.quota_remaining, 10);
}

#[tokio::test]
async fn slow_store_asks_for_redelivery() {
    let app = TestApp::spawn_with(|config| config.gates.store_timeout_ms = 50).await;
    let body = checkout_event("evt_slow", T0, "payment", "user-slow");

    app.store.set_latency(Duration::from_millis(500));
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 503);

    // Nothing was marked, so the redelivery applies.
    app.store.set_latency(Duration::ZERO);
    let json = app.deliver(&body).await;
    assert_eq!(json["outcome"], "applied");
    assert_eq!(app.entitlement("user-slow").await.quota_remaining, 2);
}

#[tokio::test]
async fn invoices_for_a_superseded_subscription_are_ignored() {
    let app = TestApp::spawn().await;
    app.deliver(&subscription_event(
        "evt_old_created",
        "customer.subscription.created",
        T0,
        "user-upgrade",
        "sub_old",
        "active",
        PRO_PRICE,
    ))
    .await;
    app.deliver(&subscription_event(
        "evt_new_created",
        "customer.subscription.created",
        T0 + 100,
        "user-upgrade",
        "sub_new",
        "active",
        ENTERPRISE_PRICE,
    ))
    .await;

    let paid = app
        .deliver(&invoice_event(
            "evt_old_paid",
            "invoice.paid",
            T0 + 200,
            "sub_old",
            "cus_user-upgrade",
        ))
        .await;
    assert_eq!(paid["outcome"], "no_op");

    let failed = app
        .deliver(&invoice_event(
            "evt_old_failed",
            "invoice.payment_failed",
            T0 + 300,
            "sub_old",
            "cus_user-upgrade",
        ))
        .await;
    assert_eq!(failed["outcome"], "no_op");

    let entitlement = app.entitlement("user-upgrade").await;
    assert_eq!(entitlement.tier, Tier::Enterprise);
    assert_eq!(entitlement.quota_limit, QuotaLimit::Unlimited);
    assert_eq!(entitlement.status, EntitlementStatus::Active);
    assert_eq!(entitlement.external_subscription_id.as_deref(), Some("sub_new"));

    let paid_new = app
        .deliver(&invoice_event(
            "evt_new_paid",
            "invoice.paid",
            T0 + 400,
            "sub_new",
            "cus_user-upgrade",
        ))
        .await;
    assert_eq!(paid_new["outcome"], "applied");
    assert_eq!(app.entitlement("user-upgrade").await.tier, Tier::Enterprise);
}

#[tokio::test]
async fn late_subscription_event_still_records_the_subscription() {
    let app = TestApp::spawn().await;
    let paid = app
        .deliver(&invoice_event_with_user(
            "evt_first_paid",
            "invoice.paid",
            T0 + 1,
            "sub_b",
            "user-late",
            PRO_PRICE,
        ))
        .await;
    assert_eq!(paid["outcome"], "applied");
    let before = app.entitlement("user-late").await;
    assert_eq!(before.tier, Tier::Pro);
    assert_eq!(before.external_subscription_id, None);

    let created = app
        .deliver(&subscription_event(
            "evt_late_created",
            "customer.subscription.created",
            T0,
            "user-late",
            "sub_b",
            "active",
            PRO_PRICE,
        ))
        .await;
    assert_eq!(created["outcome"], "stale");

    let subscription = app.subscription("sub_b").await.unwrap();
    assert_eq!(subscription.user_id, "user-late");
    assert_eq!(subscription.status, "active");

    let after = app.entitlement("user-late").await;
    assert_eq!(after.external_subscription_id.as_deref(), Some("sub_b"));
    assert!(after.period_start.is_some());
    assert!(after.period_end.is_some());
    assert_eq!(after.tier, Tier::Pro);
    assert_eq!(after.quota_remaining, 10);
    assert_eq!(after.last_applied_event_ts, before.last_applied_event_ts);
}
