//! gRPC utilities shared by the services.
//!
//! - Error conversion from `AppError` into `tonic::Status`
//! - Interceptors for trace context propagation

pub mod error;
pub mod interceptors;

pub use error::{GrpcResult, IntoStatus};
pub use interceptors::{extract_request_id, extract_traceparent, trace_context_interceptor};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response, Status};
