//! Common test utilities for entitlement-service integration tests.
//!
//! Apps run against the in-memory store, so no database is needed.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use chrono::Utc;
use entitlement_service::config::{
    DatabaseConfig, EntitlementConfig, GateConfig, RetentionConfig, StoreBackend, TierConfig,
    WebhookConfig,
};
use entitlement_service::grpc::proto::{
    entitlement_service_client::EntitlementServiceClient, CheckAndReserveRequest,
    CheckAndReserveResponse, IsAllowedRequest, IsAllowedResponse,
};
use entitlement_service::models::{Entitlement, Subscription};
use entitlement_service::services::{EntitlementStore, MemoryStore};
use entitlement_service::startup::Application;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::Config as CommonConfig;
use service_core::utils::generate_webhook_signature;
use tonic::transport::Channel;

pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const PRO_PRICE: &str = "price_pro_monthly";
pub const ENTERPRISE_PRICE: &str = "price_enterprise_monthly";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,entitlement_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_config() -> EntitlementConfig {
    EntitlementConfig {
        common: CommonConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            grpc_port: 0,
        },
        service_name: "entitlement-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        store: StoreBackend::Memory,
        database: DatabaseConfig {
            url: Secret::new(String::new()),
            max_connections: 1,
            min_connections: 1,
        },
        webhook: WebhookConfig {
            secret: Secret::new(WEBHOOK_SECRET.to_string()),
            tolerance_seconds: 300,
        },
        tiers: TierConfig {
            pro_price_ids: vec![PRO_PRICE.to_string()],
            enterprise_price_ids: vec![ENTERPRISE_PRICE.to_string()],
            ..Default::default()
        },
        gates: GateConfig {
            rate_limit_per_minute: 0,
            ..Default::default()
        },
        retention: RetentionConfig::default(),
    }
}

pub struct TestApp {
    pub http_addr: String,
    pub store: Arc<MemoryStore>,
    pub http: reqwest::Client,
    grpc: EntitlementServiceClient<Channel>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a tweaked configuration.
    pub async fn spawn_with(customize: impl FnOnce(&mut EntitlementConfig)) -> Self {
        init_tracing();

        let mut config = test_config();
        customize(&mut config);

        let store = Arc::new(MemoryStore::new());
        let app = Application::build_with_store(config, store.clone())
            .await
            .expect("Failed to build application");

        let http_addr = format!("http://127.0.0.1:{}", app.http_port());
        let grpc_addr = format!("http://127.0.0.1:{}", app.grpc_port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for server to be ready with retry
        let grpc = {
            let mut attempts = 0;
            loop {
                match EntitlementServiceClient::connect(grpc_addr.clone()).await {
                    Ok(client) => break client,
                    Err(_) if attempts < 20 => {
                        attempts += 1;
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                    Err(e) => panic!("Failed to connect gRPC client after 20 attempts: {}", e),
                }
            }
        };

        Self {
            http_addr,
            store,
            http: reqwest::Client::new(),
            grpc,
        }
    }

    pub fn grpc(&self) -> EntitlementServiceClient<Channel> {
        self.grpc.clone()
    }

    /// Deliver a correctly signed webhook.
    pub async fn post_webhook(&self, body: &str) -> reqwest::Response {
        let signature = sign(body);
        self.post_webhook_with_signature(body, Some(&signature)).await
    }

    pub async fn post_webhook_with_signature(
        &self,
        body: &str,
        signature: Option<&str>,
    ) -> reqwest::Response {
        let mut request = self
            .http
            .post(format!("{}/webhooks/billing", self.http_addr))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(signature) = signature {
            request = request.header("Stripe-Signature", signature);
        }
        request.send().await.expect("Failed to send webhook")
    }

    /// Deliver a webhook and return its JSON body, asserting a 200.
    pub async fn deliver(&self, body: &str) -> Value {
        let response = self.post_webhook(body).await;
        assert_eq!(response.status().as_u16(), 200, "webhook was not acknowledged");
        response.json().await.expect("Webhook response is not JSON")
    }

    pub async fn entitlement(&self, user_id: &str) -> Entitlement {
        self.store
            .get_entitlement(user_id)
            .await
            .expect("store error")
            .expect("entitlement missing")
    }

    pub async fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await
            .expect("store error")
    }

    pub async fn check_and_reserve(&self, user_id: &str) -> CheckAndReserveResponse {
        self.grpc()
            .check_and_reserve(CheckAndReserveRequest {
                user_id: user_id.to_string(),
            })
            .await
            .expect("CheckAndReserve failed")
            .into_inner()
    }

    pub async fn is_allowed(&self, user_id: &str, feature: &str) -> IsAllowedResponse {
        self.grpc()
            .is_allowed(IsAllowedRequest {
                user_id: user_id.to_string(),
                feature: feature.to_string(),
            })
            .await
            .expect("IsAllowed failed")
            .into_inner()
    }
}

pub fn sign(body: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let signature =
        generate_webhook_signature(WEBHOOK_SECRET, timestamp, body).expect("Failed to sign");
    format!("t={},v1={}", timestamp, signature)
}

fn envelope(event_id: &str, event_type: &str, created: i64, object: Value) -> String {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": created,
        "data": { "object": object }
    })
    .to_string()
}

/// A `customer.subscription.*` event carrying `user_id` in metadata.
pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    created: i64,
    user_id: &str,
    subscription_id: &str,
    status: &str,
    price_id: &str,
) -> String {
    envelope(
        event_id,
        event_type,
        created,
        json!({
            "id": subscription_id,
            "object": "subscription",
            "customer": format!("cus_{}", user_id),
            "status": status,
            "metadata": { "user_id": user_id },
            "items": { "data": [{ "price": { "id": price_id } }] },
            "current_period_start": created,
            "current_period_end": created + 30 * 24 * 3600,
            "cancel_at_period_end": false,
            "created": created
        }),
    )
}

/// An `invoice.*` event that identifies the user only through its
/// subscription and customer.
pub fn invoice_event(
    event_id: &str,
    event_type: &str,
    created: i64,
    subscription_id: &str,
    customer_id: &str,
) -> String {
    envelope(
        event_id,
        event_type,
        created,
        json!({
            "id": format!("in_{}", event_id),
            "object": "invoice",
            "customer": customer_id,
            "subscription": subscription_id
        }),
    )
}

/// Invoice that names its user in metadata and its price on a line item.
pub fn invoice_event_with_user(
    event_id: &str,
    event_type: &str,
    created: i64,
    subscription_id: &str,
    user_id: &str,
    price_id: &str,
) -> String {
    envelope(
        event_id,
        event_type,
        created,
        json!({
            "id": format!("in_{}", event_id),
            "object": "invoice",
            "customer": format!("cus_{}", user_id),
            "subscription": subscription_id,
            "metadata": { "user_id": user_id },
            "lines": { "data": [{ "price": { "id": price_id } }] }
        }),
    )
}

pub fn checkout_event(event_id: &str, created: i64, mode: &str, user_id: &str) -> String {
    envelope(
        event_id,
        "checkout.session.completed",
        created,
        json!({
            "id": format!("cs_{}", event_id),
            "object": "checkout.session",
            "mode": mode,
            "client_reference_id": user_id,
            "customer": format!("cus_{}", user_id),
            "amount_total": 500,
            "currency": "usd",
            "payment_status": "paid"
        }),
    )
}
