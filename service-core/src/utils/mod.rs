pub mod signature;

pub use signature::{
    SignatureError, WebhookSignature, generate_webhook_signature, verify_webhook_signature,
};
