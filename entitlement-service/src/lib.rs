//! Entitlement Service - billing-event reconciliation and quota/feature gates.

pub mod config;
pub mod gates;
pub mod grpc;
pub mod models;
pub mod reconciler;
pub mod services;
pub mod startup;
pub mod webhooks;
