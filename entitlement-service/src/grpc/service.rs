//! EntitlementService gRPC implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use service_core::grpc::IntoStatus;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use crate::gates::{Feature, FeatureGate, QuotaGate};
use crate::grpc::proto::{
    entitlement_service_server::EntitlementService, CheckAndReserveRequest,
    CheckAndReserveResponse, EnsureEntitlementRequest, EnsureEntitlementResponse,
    Entitlement as ProtoEntitlement, GetEntitlementRequest, GetEntitlementResponse,
    IsAllowedRequest, IsAllowedResponse,
};
use crate::models::Entitlement;
use crate::reconciler::TierTable;
use crate::services::{
    record_grpc_request, record_grpc_request_duration, with_timeout, EntitlementStore,
};

pub struct EntitlementServiceImpl {
    store: Arc<dyn EntitlementStore>,
    quota: QuotaGate,
    features: FeatureGate,
    tiers: Arc<TierTable>,
    timeout: Duration,
}

impl EntitlementServiceImpl {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        quota: QuotaGate,
        features: FeatureGate,
        tiers: Arc<TierTable>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            quota,
            features,
            tiers,
            timeout,
        }
    }

    fn entitlement_to_proto(entitlement: &Entitlement) -> ProtoEntitlement {
        ProtoEntitlement {
            user_id: entitlement.user_id.clone(),
            tier: entitlement.tier.to_proto(),
            status: entitlement.status.to_proto(),
            quota_limit: entitlement.quota_limit.limited(),
            quota_remaining: entitlement.quota_remaining,
            period_start: entitlement.period_start.map(to_timestamp),
            period_end: entitlement.period_end.map(to_timestamp),
            external_customer_id: entitlement.external_customer_id.clone().unwrap_or_default(),
            external_subscription_id: entitlement
                .external_subscription_id
                .clone()
                .unwrap_or_default(),
            last_applied_event_at: entitlement.last_applied_event_ts.map(to_timestamp),
        }
    }
}

fn to_timestamp(t: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

#[allow(clippy::result_large_err)]
fn require_user_id(method: &str, user_id: &str) -> Result<(), Status> {
    if user_id.trim().is_empty() {
        record_grpc_request(method, "invalid_argument");
        return Err(Status::invalid_argument("user_id is required"));
    }
    Ok(())
}

fn finish(method: &str, status: &str, started: Instant) {
    record_grpc_request(method, status);
    record_grpc_request_duration(method, started.elapsed().as_secs_f64());
}

#[tonic::async_trait]
impl EntitlementService for EntitlementServiceImpl {
    #[instrument(
        skip(self, request),
        fields(service = "entitlement-service", method = "CheckAndReserve")
    )]
    async fn check_and_reserve(
        &self,
        request: Request<CheckAndReserveRequest>,
    ) -> Result<Response<CheckAndReserveResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        require_user_id("CheckAndReserve", &req.user_id)?;

        let decision = self.quota.check_and_reserve(&req.user_id).await;
        finish("CheckAndReserve", "ok", started);

        Ok(Response::new(CheckAndReserveResponse {
            allowed: decision.allowed,
            tier: decision.tier.map(|t| t.to_proto()).unwrap_or(0),
            remaining: decision.remaining,
            unlimited: decision.unlimited,
            reason: decision.reason.map(|r| r.to_proto()).unwrap_or(0),
            message: decision
                .reason
                .map(|r| r.message().to_string())
                .unwrap_or_default(),
            redirect: decision.redirect.unwrap_or_default(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "entitlement-service", method = "IsAllowed")
    )]
    async fn is_allowed(
        &self,
        request: Request<IsAllowedRequest>,
    ) -> Result<Response<IsAllowedResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        require_user_id("IsAllowed", &req.user_id)?;

        let feature: Feature = req.feature.parse().map_err(|e| {
            record_grpc_request("IsAllowed", "invalid_argument");
            Status::invalid_argument(format!("{}", e))
        })?;

        let decision = self.features.is_allowed(&req.user_id, feature).await;
        finish("IsAllowed", "ok", started);

        Ok(Response::new(IsAllowedResponse {
            allowed: decision.allowed,
            tier: decision.tier.map(|t| t.to_proto()).unwrap_or(0),
            reason: decision.reason.map(|r| r.to_proto()).unwrap_or(0),
            message: decision
                .reason
                .map(|r| r.message().to_string())
                .unwrap_or_default(),
            redirect: decision.redirect.unwrap_or_default(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "entitlement-service", method = "GetEntitlement")
    )]
    async fn get_entitlement(
        &self,
        request: Request<GetEntitlementRequest>,
    ) -> Result<Response<GetEntitlementResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        require_user_id("GetEntitlement", &req.user_id)?;

        let entitlement = with_timeout(
            "get_entitlement",
            self.timeout,
            self.store.get_entitlement(&req.user_id),
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to load entitlement");
            finish("GetEntitlement", "error", started);
            e.into_status()
        })?
        .ok_or_else(|| {
            finish("GetEntitlement", "not_found", started);
            Status::not_found("Entitlement not found")
        })?;

        finish("GetEntitlement", "ok", started);

        Ok(Response::new(GetEntitlementResponse {
            entitlement: Some(Self::entitlement_to_proto(&entitlement)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "entitlement-service", method = "EnsureEntitlement")
    )]
    async fn ensure_entitlement(
        &self,
        request: Request<EnsureEntitlementRequest>,
    ) -> Result<Response<EnsureEntitlementResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        require_user_id("EnsureEntitlement", &req.user_id)?;

        let entitlement = with_timeout(
            "ensure_entitlement",
            self.timeout,
            self.store
                .ensure_entitlement(&req.user_id, self.tiers.free_limit()),
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to ensure entitlement");
            finish("EnsureEntitlement", "error", started);
            e.into_status()
        })?;

        finish("EnsureEntitlement", "ok", started);
        info!(user_id = %entitlement.user_id, tier = %entitlement.tier, "Entitlement ensured");

        Ok(Response::new(EnsureEntitlementResponse {
            entitlement: Some(Self::entitlement_to_proto(&entitlement)),
        }))
    }
}
