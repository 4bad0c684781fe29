use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::QuotaLimit;
use crate::reconciler::{TierLimits, TierTable};

#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreBackend,
    pub database: DatabaseConfig,
    pub webhook: WebhookConfig,
    pub tiers: TierConfig,
    pub gates: GateConfig,
    pub retention: RetentionConfig,
}

/// Which `EntitlementStore` implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown store backend '{}', expected 'postgres' or 'memory'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared HMAC secret the processor signs deliveries with.
    pub secret: Secret<String>,
    pub tolerance_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct TierConfig {
    pub pro_price_ids: Vec<String>,
    pub enterprise_price_ids: Vec<String>,
    pub free_quota: i32,
    pub pro_quota: i32,
    /// `None` means unlimited.
    pub enterprise_quota: Option<i32>,
}

impl TierConfig {
    pub fn table(&self) -> TierTable {
        TierTable::new(
            self.pro_price_ids.iter().cloned(),
            self.enterprise_price_ids.iter().cloned(),
            TierLimits {
                free: QuotaLimit::Limited(self.free_quota),
                pro: QuotaLimit::Limited(self.pro_quota),
                enterprise: self
                    .enterprise_quota
                    .map(QuotaLimit::Limited)
                    .unwrap_or(QuotaLimit::Unlimited),
            },
        )
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            pro_price_ids: Vec::new(),
            enterprise_price_ids: Vec::new(),
            free_quota: 1,
            pro_quota: 10,
            enterprise_quota: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub upgrade_url: String,
    pub billing_url: String,
    pub store_timeout_ms: u64,
    /// Quota checks per user per minute; 0 disables limiting.
    pub rate_limit_per_minute: u32,
}

impl GateConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            upgrade_url: "/pricing".to_string(),
            billing_url: "/account/billing".to_string(),
            store_timeout_ms: 2000,
            rate_limit_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub processed_event_days: i64,
    pub prune_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            processed_event_days: 30,
            prune_interval_secs: 3600,
        }
    }
}

impl EntitlementConfig {
    /// Load from `ENTITLEMENT_*` environment variables (and `.env`), with the
    /// listen addresses coming from the shared core config.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let common = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";
        let store: StoreBackend =
            get_env("ENTITLEMENT_STORE_BACKEND", Some("postgres"), is_prod)?.parse()?;

        let database_url = match store {
            StoreBackend::Postgres => get_env("ENTITLEMENT_DATABASE_URL", None, is_prod)?,
            StoreBackend::Memory => env::var("ENTITLEMENT_DATABASE_URL").unwrap_or_default(),
        };

        let retention_days: i64 = parse_env("ENTITLEMENT_PROCESSED_EVENT_RETENTION_DAYS", 30)?;
        if retention_days < 30 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ENTITLEMENT_PROCESSED_EVENT_RETENTION_DAYS must be at least 30, got {}",
                retention_days
            )));
        }

        let enterprise_quota = match env::var("ENTITLEMENT_ENTERPRISE_QUOTA") {
            Ok(v) if v.eq_ignore_ascii_case("unlimited") || v.is_empty() => None,
            Ok(v) => Some(v.parse().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "ENTITLEMENT_ENTERPRISE_QUOTA is invalid: {}",
                    e
                ))
            })?),
            Err(_) => None,
        };

        Ok(EntitlementConfig {
            common,
            service_name: get_env("ENTITLEMENT_SERVICE_NAME", Some("entitlement-service"), false)?,
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: get_env("ENTITLEMENT_LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            store,
            database: DatabaseConfig {
                url: Secret::new(database_url),
                max_connections: parse_env("ENTITLEMENT_DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("ENTITLEMENT_DATABASE_MIN_CONNECTIONS", 1)?,
            },
            webhook: WebhookConfig {
                secret: Secret::new(get_env("ENTITLEMENT_WEBHOOK_SECRET", None, is_prod)?),
                tolerance_seconds: parse_env("ENTITLEMENT_WEBHOOK_TOLERANCE_SECONDS", 300)?,
            },
            tiers: TierConfig {
                pro_price_ids: list_env("ENTITLEMENT_PRO_PRICE_IDS"),
                enterprise_price_ids: list_env("ENTITLEMENT_ENTERPRISE_PRICE_IDS"),
                free_quota: parse_env("ENTITLEMENT_FREE_QUOTA", 1)?,
                pro_quota: parse_env("ENTITLEMENT_PRO_QUOTA", 10)?,
                enterprise_quota,
            },
            gates: GateConfig {
                upgrade_url: get_env("ENTITLEMENT_UPGRADE_URL", Some("/pricing"), false)?,
                billing_url: get_env("ENTITLEMENT_BILLING_URL", Some("/account/billing"), false)?,
                store_timeout_ms: parse_env("ENTITLEMENT_STORE_TIMEOUT_MS", 2000)?,
                rate_limit_per_minute: parse_env("ENTITLEMENT_RATE_LIMIT_PER_MINUTE", 60)?,
            },
            retention: RetentionConfig {
                processed_event_days: retention_days,
                prune_interval_secs: parse_env("ENTITLEMENT_PRUNE_INTERVAL_SECS", 3600)?,
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

/// Comma-separated list; blanks are dropped.
fn list_env(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
