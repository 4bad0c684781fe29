//! HMAC-SHA256 webhook signatures.
//!
//! Header format: `t=<unix seconds>,v1=<hex signature>[,v1=<hex signature>...]`
//! where each signature is `HMAC-SHA256("{t}.{body}", secret)`. Several `v1`
//! entries may be present while the sender rolls its secret; any match passes.
//! Unknown schemes (e.g. `v0`) are ignored.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_SCHEME: &str = "v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    MalformedHeader,

    #[error("signature header carries no timestamp")]
    MissingTimestamp,

    #[error("signature header carries no v1 signature")]
    NoSignatures,

    #[error("timestamp {timestamp} is outside the tolerance window (now {now})")]
    OutsideTolerance { timestamp: i64, now: i64 },

    #[error("no signature matches the payload")]
    Mismatch,

    #[error("signing secret is not usable: {0}")]
    InvalidKey(String),
}

impl SignatureError {
    /// Whether the failure is on our side (unusable secret) rather than a bad
    /// request; only those are worth a redelivery.
    pub fn is_transient(&self) -> bool {
        matches!(self, SignatureError::InvalidKey(_))
    }
}

/// Parsed `t=...,v1=...` signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSignature {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl WebhookSignature {
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or(SignatureError::MalformedHeader)?;
            match key {
                "t" => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| SignatureError::MalformedHeader)?,
                    )
                }
                SIGNATURE_SCHEME => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        if signatures.is_empty() {
            return Err(SignatureError::NoSignatures);
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Compute the hex signature for `body` signed at `timestamp`.
pub fn generate_webhook_signature(
    secret: &str,
    timestamp: i64,
    body: &str,
) -> Result<String, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidKey("secret is empty".to_string()));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against `body` using constant-time comparison.
///
/// Returns the signed timestamp on success. `now` and `tolerance_secs` are unix
/// seconds; a header older or newer than the tolerance is rejected to bound
/// replay.
pub fn verify_webhook_signature(
    secret: &str,
    header: &str,
    body: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<i64, SignatureError> {
    let parsed = WebhookSignature::parse(header)?;

    if (now - parsed.timestamp).abs() > tolerance_secs {
        return Err(SignatureError::OutsideTolerance {
            timestamp: parsed.timestamp,
            now,
        });
    }

    let expected = generate_webhook_signature(secret, parsed.timestamp, body)?;
    let expected_bytes = expected.as_bytes();

    let matched = parsed.signatures.iter().any(|candidate| {
        let candidate = candidate.as_bytes();
        candidate.len() == expected_bytes.len() && bool::from(expected_bytes.ct_eq(candidate))
    });

    if matched {
        Ok(parsed.timestamp)
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &str = r#"{"id":"evt_1","type":"invoice.paid"}"#;
    const NOW: i64 = 1_700_000_000;

    fn header_for(secret: &str, timestamp: i64, body: &str) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            generate_webhook_signature(secret, timestamp, body).unwrap()
        )
    }

    #[test]
    fn test_signature_generation_and_verification() {
        let header = header_for(SECRET, NOW, BODY);
        assert_eq!(
            verify_webhook_signature(SECRET, &header, BODY, 300, NOW + 10),
            Ok(NOW)
        );
    }

    #[test]
    fn test_tampered_body() {
        let header = header_for(SECRET, NOW, BODY);
        let tampered = r#"{"id":"evt_1","type":"invoice.payment_failed"}"#;
        assert_eq!(
            verify_webhook_signature(SECRET, &header, tampered, 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret() {
        let header = header_for("another_secret", NOW, BODY);
        assert_eq!(
            verify_webhook_signature(SECRET, &header, BODY, 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_expired_timestamp() {
        let header = header_for(SECRET, NOW, BODY);
        assert!(matches!(
            verify_webhook_signature(SECRET, &header, BODY, 300, NOW + 301),
            Err(SignatureError::OutsideTolerance { .. })
        ));
    }

    #[test]
    fn test_any_of_rolled_signatures_matches() {
        let good = generate_webhook_signature(SECRET, NOW, BODY).unwrap();
        let header = format!("t={},v1=deadbeef,v0=ignored,v1={}", NOW, good);
        assert_eq!(
            verify_webhook_signature(SECRET, &header, BODY, 300, NOW),
            Ok(NOW)
        );
    }

    #[test]
    fn test_header_parsing_errors() {
        assert_eq!(
            WebhookSignature::parse("v1=abc"),
            Err(SignatureError::MissingTimestamp)
        );
        assert_eq!(
            WebhookSignature::parse("t=123"),
            Err(SignatureError::NoSignatures)
        );
        assert_eq!(
            WebhookSignature::parse("garbage"),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            WebhookSignature::parse("t=abc,v1=ff"),
            Err(SignatureError::MalformedHeader)
        );
    }

    #[test]
    fn test_empty_secret_is_transient() {
        let err = generate_webhook_signature("", NOW, BODY).unwrap_err();
        assert!(err.is_transient());
        assert!(!SignatureError::Mismatch.is_transient());
    }
}
