use chrono::Utc;
use secrecy::{ExposeSecret, Secret};
use service_core::utils::{verify_webhook_signature, SignatureError};

/// Header the billing processor puts its signature in.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Verifies webhook deliveries against the shared signing secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Secret<String>,
    tolerance_seconds: i64,
}

impl WebhookVerifier {
    pub fn new(secret: Secret<String>, tolerance_seconds: i64) -> Self {
        Self {
            secret,
            tolerance_seconds,
        }
    }

    /// Check `header` against the raw `body`. Returns the signed timestamp.
    pub fn verify(&self, header: Option<&str>, body: &str) -> Result<i64, SignatureError> {
        self.verify_at(header, body, Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        header: Option<&str>,
        body: &str,
        now: i64,
    ) -> Result<i64, SignatureError> {
        let header = header
            .filter(|h| !h.trim().is_empty())
            .ok_or(SignatureError::MalformedHeader)?;
        verify_webhook_signature(
            self.secret.expose_secret(),
            header,
            body,
            self.tolerance_seconds,
            now,
        )
    }
}
