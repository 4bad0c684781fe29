//! Usage record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    /// One unit of quota reserved by the quota gate.
    AnalysisCreated,
    /// One unit of quota bought through a one-time checkout.
    CreditPurchased,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::AnalysisCreated => "analysis_created",
            UsageType::CreditPurchased => "credit_purchased",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "analysis_created" => Some(UsageType::AnalysisCreated),
            "credit_purchased" => Some(UsageType::CreditPurchased),
            _ => None,
        }
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub record_id: Uuid,
    pub user_id: String,
    pub subscription_id: Option<String>,
    pub usage_type: UsageType,
    pub quantity: i32,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Input for appending a ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUsage {
    pub user_id: String,
    pub subscription_id: Option<String>,
    pub usage_type: UsageType,
    pub quantity: i32,
    pub metadata: Option<serde_json::Value>,
}

impl RecordUsage {
    pub fn into_record(self, record_id: Uuid, timestamp: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            record_id,
            user_id: self.user_id,
            subscription_id: self.subscription_id,
            usage_type: self.usage_type,
            quantity: self.quantity,
            timestamp,
            metadata: self.metadata,
        }
    }
}
