//! Application startup and lifecycle management.
//!
//! HTTP carries health, metrics and the billing webhook; the gates are served
//! over gRPC.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    middleware::from_fn,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use service_core::grpc::trace_context_interceptor;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use service_core::tower::ServiceBuilder;
use tokio::net::TcpListener;
use tonic::transport::Server as GrpcServer;
use tower_http::trace::TraceLayer;

use crate::config::{EntitlementConfig, StoreBackend};
use crate::gates::{FeatureGate, QuotaGate, Redirects};
use crate::grpc::{
    proto::{entitlement_service_server::EntitlementServiceServer, FILE_DESCRIPTOR_SET},
    EntitlementServiceImpl,
};
use crate::reconciler::Reconciler;
use crate::services::{
    get_metrics, init_metrics, spawn_prune_task, Database, EntitlementStore, MemoryStore,
    RateLimiter,
};
use crate::webhooks::{billing_webhook, WebhookProcessor, WebhookVerifier};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: EntitlementConfig,
    pub store: Arc<dyn EntitlementStore>,
    pub webhooks: WebhookProcessor,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let timeout = state.config.gates.store_timeout();
    let result = match tokio::time::timeout(timeout, state.store.health_check()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("store health check timed out after {:?}", timeout)),
    };

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": state.config.service_name,
                "version": state.config.service_version
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": state.config.service_name,
                "error": e
            })),
        ),
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let timeout = state.config.gates.store_timeout();
    match tokio::time::timeout(timeout, state.store.health_check()).await {
        Ok(Ok(_)) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Open the configured store, running migrations for Postgres.
pub async fn connect_store(
    config: &EntitlementConfig,
) -> Result<Arc<dyn EntitlementStore>, AppError> {
    match config.store {
        StoreBackend::Postgres => {
            let db = Database::new(
                config.database.url.expose_secret(),
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to PostgreSQL: {}", e);
                e
            })?;
            db.run_migrations().await?;
            Ok(Arc::new(db))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/webhooks/billing", post(billing_webhook))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    grpc_port: u16,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    state: AppState,
    grpc_service: EntitlementServiceImpl,
}

impl Application {
    /// Build the application with the configured store.
    pub async fn build(config: EntitlementConfig) -> Result<Self, AppError> {
        let store = connect_store(&config).await?;
        Self::build_with_store(config, store).await
    }

    /// Build the application around an already opened store.
    pub async fn build_with_store(
        config: EntitlementConfig,
        store: Arc<dyn EntitlementStore>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let timeout = config.gates.store_timeout();
        let tiers = Arc::new(config.tiers.table());
        let redirects = Redirects {
            upgrade_url: config.gates.upgrade_url.clone(),
            billing_url: config.gates.billing_url.clone(),
        };

        let reconciler = Reconciler::new(store.clone(), tiers.clone(), timeout);
        let webhooks = WebhookProcessor::new(
            WebhookVerifier::new(
                config.webhook.secret.clone(),
                config.webhook.tolerance_seconds,
            ),
            reconciler,
            store.clone(),
            timeout,
        );

        let quota = QuotaGate::new(
            store.clone(),
            RateLimiter::per_minute(store.clone(), config.gates.rate_limit_per_minute),
            redirects.clone(),
            timeout,
        );
        let features = FeatureGate::new(store.clone(), redirects, timeout);
        let grpc_service =
            EntitlementServiceImpl::new(store.clone(), quota, features, tiers, timeout);

        // Bind listeners up front (port 0 = random port for testing)
        let http_addr = config.common.http_addr()?;
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", http_addr, e);
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        let grpc_addr = config.common.grpc_addr()?;
        let grpc_listener = TcpListener::bind(grpc_addr).await.map_err(|e| {
            tracing::error!("Failed to bind gRPC listener to {}: {}", grpc_addr, e);
            AppError::from(e)
        })?;
        let grpc_port = grpc_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            grpc_port = grpc_port,
            store = ?config.store,
            "Entitlement service bound"
        );

        Ok(Self {
            http_port,
            grpc_port,
            http_listener,
            grpc_listener,
            state: AppState {
                config,
                store,
                webhooks,
            },
            grpc_service,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get the gRPC port the server is listening on.
    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    pub fn store(&self) -> Arc<dyn EntitlementStore> {
        self.state.store.clone()
    }

    /// Run the HTTP and gRPC servers and the retention task until either
    /// server exits.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let retention = &self.state.config.retention;
        let prune_task = spawn_prune_task(
            self.state.store.clone(),
            retention.processed_event_days,
            Duration::from_secs(retention.prune_interval_secs.max(1)),
        );

        let http_router = build_router(self.state);

        // gRPC health service
        let (mut health_reporter, grpc_health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<EntitlementServiceServer<EntitlementServiceImpl>>()
            .await;

        // Reflection service for debugging
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| {
                std::io::Error::other(format!("Failed to build reflection service: {}", e))
            })?;

        let layer = ServiceBuilder::new()
            .layer(tonic::service::interceptor(trace_context_interceptor))
            .into_inner();

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(self.grpc_listener);
        let grpc_server = GrpcServer::builder()
            .layer(layer)
            .add_service(grpc_health_service)
            .add_service(reflection_service)
            .add_service(EntitlementServiceServer::new(self.grpc_service))
            .serve_with_incoming(incoming);

        // Run both servers concurrently
        let result = tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                result.map_err(|e| {
                    tracing::error!("HTTP server error: {}", e);
                    std::io::Error::other(format!("HTTP server error: {}", e))
                })
            }
            result = grpc_server => {
                result.map_err(|e| {
                    tracing::error!("gRPC server error: {}", e);
                    std::io::Error::other(format!("gRPC server error: {}", e))
                })
            }
        };

        prune_task.abort();
        result
    }
}
