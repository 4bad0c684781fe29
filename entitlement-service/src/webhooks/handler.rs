//! `POST /webhooks/billing`.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::startup::AppState;
use crate::webhooks::ingest::WebhookError;
use crate::webhooks::verifier::SIGNATURE_HEADER;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub event_id: String,
    pub outcome: String,
}

/// Every acknowledged outcome answers 200 so the processor stops retrying;
/// only transient failures ask for a redelivery.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, WebhookError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.webhooks.process(signature, &body).await?;

    Ok(Json(WebhookResponse {
        received: true,
        event_id: outcome.event_id,
        outcome: outcome.outcome.as_str().to_string(),
    }))
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            WebhookError::Signature(e) if e.is_transient() => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Signature verification unavailable" })),
            )
                .into_response(),
            WebhookError::Signature(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid signature", "details": e.to_string() })),
            )
                .into_response(),
            WebhookError::Malformed(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Malformed event", "details": e.to_string() })),
            )
                .into_response(),
            WebhookError::Store(e) => e.into_response(),
        }
    }
}
