//! gRPC module for entitlement-service.

mod service;

pub use service::EntitlementServiceImpl;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("entitlement.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("entitlement_descriptor");
}
