//! Database service for entitlement-service.

use crate::models::{
    Entitlement, EntitlementStatus, EventOutcome, ProcessedEvent, QuotaLimit, RecordUsage,
    Subscription, Tier, UsageRecord, UsageType,
};
use crate::reconciler::ReconcilePlan;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{CommitOutcome, EntitlementStore, EventRef, PruneStats, Reservation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const ENTITLEMENT_COLUMNS: &str = "user_id, tier, status, quota_limit, quota_remaining, \
     period_start, period_end, external_customer_id, external_subscription_id, \
     last_applied_event_ts, created_utc, updated_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, customer_id, status, price_id, \
     period_start, period_end, cancel_at_period_end, created_at, updated_utc";

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    user_id: String,
    tier: String,
    status: String,
    quota_limit: i32,
    quota_remaining: i32,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    external_customer_id: Option<String>,
    external_subscription_id: Option<String>,
    last_applied_event_ts: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<EntitlementRow> for Entitlement {
    fn from(row: EntitlementRow) -> Self {
        Self {
            user_id: row.user_id,
            tier: Tier::from_string(&row.tier),
            status: EntitlementStatus::from_string(&row.status),
            quota_limit: QuotaLimit::from_db(row.quota_limit),
            quota_remaining: row.quota_remaining,
            period_start: row.period_start,
            period_end: row.period_end,
            external_customer_id: row.external_customer_id,
            external_subscription_id: row.external_subscription_id,
            last_applied_event_ts: row.last_applied_event_ts,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: String,
    user_id: String,
    customer_id: Option<String>,
    status: String,
    price_id: Option<String>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    created_at: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            customer_id: row.customer_id,
            status: row.status,
            price_id: row.price_id,
            period_start: row.period_start,
            period_end: row.period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            created_at: row.created_at,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    record_id: Uuid,
    user_id: String,
    subscription_id: Option<String>,
    usage_type: String,
    quantity: i32,
    timestamp: DateTime<Utc>,
    metadata: Option<serde_json::Value>,
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = AppError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        let usage_type = UsageType::from_string(&row.usage_type).ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Unknown usage type in ledger: {}",
                row.usage_type
            ))
        })?;
        Ok(Self {
            record_id: row.record_id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            usage_type,
            quantity: row.quantity,
            timestamp: row.timestamp,
            metadata: row.metadata,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessedEventRow {
    event_id: String,
    event_type: String,
    outcome: String,
    processed_at: DateTime<Utc>,
}

impl From<ProcessedEventRow> for ProcessedEvent {
    fn from(row: ProcessedEventRow) -> Self {
        Self {
            event_id: row.event_id,
            event_type: row.event_type,
            outcome: EventOutcome::from_string(&row.outcome),
            processed_at: row.processed_at,
        }
    }
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "entitlement-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn insert_processed(
        tx: &mut Transaction<'_, Postgres>,
        event: EventRef<'_>,
        outcome: EventOutcome,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, outcome, processed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.event_type)
        .bind(outcome.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to record processed event", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_usage(
        tx: &mut Transaction<'_, Postgres>,
        usage: &RecordUsage,
    ) -> Result<UsageRecord, AppError> {
        let row = sqlx::query_as::<_, UsageRow>(
            r#"
            INSERT INTO usage_records (record_id, user_id, subscription_id, usage_type, quantity, timestamp, metadata)
            VALUES ($1, $2, $3, $4, $5, NOW(), $6)
            RETURNING record_id, user_id, subscription_id, usage_type, quantity, timestamp, metadata
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&usage.user_id)
        .bind(&usage.subscription_id)
        .bind(usage.usage_type.as_str())
        .bind(usage.quantity)
        .bind(&usage.metadata)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to append usage record", e))?;

        row.try_into()
    }

    async fn write_entitlement(
        tx: &mut Transaction<'_, Postgres>,
        entitlement: &Entitlement,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE entitlements
            SET tier = $2, status = $3, quota_limit = $4, quota_remaining = $5,
                period_start = $6, period_end = $7, external_customer_id = $8,
                external_subscription_id = $9, last_applied_event_ts = $10, updated_utc = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(&entitlement.user_id)
        .bind(entitlement.tier.as_str())
        .bind(entitlement.status.as_str())
        .bind(entitlement.quota_limit.to_db())
        .bind(entitlement.quota_remaining)
        .bind(entitlement.period_start)
        .bind(entitlement.period_end)
        .bind(&entitlement.external_customer_id)
        .bind(&entitlement.external_subscription_id)
        .bind(entitlement.last_applied_event_ts)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to update entitlement", e))?;

        Ok(())
    }

    async fn upsert_subscription(
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, customer_id, status, price_id, period_start, period_end, cancel_at_period_end, created_at, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (subscription_id) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                customer_id = COALESCE(EXCLUDED.customer_id, subscriptions.customer_id),
                status = EXCLUDED.status,
                price_id = COALESCE(EXCLUDED.price_id, subscriptions.price_id),
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_utc = NOW()
            "#,
        )
        .bind(&subscription.subscription_id)
        .bind(&subscription.user_id)
        .bind(&subscription.customer_id)
        .bind(&subscription.status)
        .bind(&subscription.price_id)
        .bind(subscription.period_start)
        .bind(subscription.period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to upsert subscription", e))?;

        Ok(())
    }

    /// Returns true if the row was inserted.
    async fn insert_subscription_if_missing(
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, customer_id, status, price_id, period_start, period_end, cancel_at_period_end, created_at, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (subscription_id) DO NOTHING
            "#,
        )
        .bind(&subscription.subscription_id)
        .bind(&subscription.user_id)
        .bind(&subscription.customer_id)
        .bind(&subscription.status)
        .bind(&subscription.price_id)
        .bind(subscription.period_start)
        .bind(subscription.period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to insert subscription", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl EntitlementStore for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn ensure_entitlement(
        &self,
        user_id: &str,
        free_limit: QuotaLimit,
    ) -> Result<Entitlement, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ensure_entitlement"])
            .start_timer();

        let created = sqlx::query(
            r#"
            INSERT INTO entitlements (user_id, tier, status, quota_limit, quota_remaining)
            VALUES ($1, 'free', 'none', $2, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(free_limit.to_db())
        .bind(free_limit.limited().unwrap_or(0))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create entitlement", e))?;

        let row = sqlx::query_as::<_, EntitlementRow>(&format!(
            "SELECT {} FROM entitlements WHERE user_id = $1",
            ENTITLEMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load entitlement", e))?;

        timer.observe_duration();
        if created.rows_affected() == 1 {
            info!(user_id = %user_id, "Free-tier entitlement created");
        }

        Ok(row.into())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_entitlement"])
            .start_timer();

        let row = sqlx::query_as::<_, EntitlementRow>(&format!(
            "SELECT {} FROM entitlements WHERE user_id = $1",
            ENTITLEMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get entitlement", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn find_entitlement_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Entitlement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_entitlement_by_customer"])
            .start_timer();

        let row = sqlx::query_as::<_, EntitlementRow>(&format!(
            "SELECT {} FROM entitlements WHERE external_customer_id = $1 ORDER BY updated_utc DESC LIMIT 1",
            ENTITLEMENT_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find entitlement by customer", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn find_subscription_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscription_by_customer"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE customer_id = $1 ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find subscription by customer", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list subscriptions", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    async fn get_processed_event(
        &self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_processed_event"])
            .start_timer();

        let row = sqlx::query_as::<_, ProcessedEventRow>(
            r#"
            SELECT event_id, event_type, outcome, processed_at
            FROM processed_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get processed event", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(event_id = %event.event_id, outcome = %outcome))]
    async fn record_event(
        &self,
        event: EventRef<'_>,
        outcome: EventOutcome,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_event"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        let inserted = Self::insert_processed(&mut tx, event, outcome).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit processed event", e))?;

        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self, plan), fields(event_id = %event.event_id, user_id = %plan.user_id))]
    async fn commit_plan(
        &self,
        event: EventRef<'_>,
        plan: &ReconcilePlan,
    ) -> Result<CommitOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_plan"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let row = sqlx::query_as::<_, EntitlementRow>(&format!(
            "SELECT {} FROM entitlements WHERE user_id = $1 FOR UPDATE",
            ENTITLEMENT_COLUMNS
        ))
        .bind(&plan.user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock entitlement", e))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("No entitlement for user {}", plan.user_id))
        })?;
        let current: Entitlement = row.into();

        let stale = plan.is_stale_against(&current);
        let outcome = if stale {
            EventOutcome::Stale
        } else {
            EventOutcome::Applied
        };

        // The marker goes in first: losing the insert race to a concurrent
        // delivery rolls this whole transaction back.
        if !Self::insert_processed(&mut tx, event, outcome).await? {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back duplicate", e))?;
            timer.observe_duration();
            return Ok(CommitOutcome::Duplicate);
        }

        if stale {
            // A late event may still carry the first sighting of a subscription.
            if let Some(subscription) = &plan.subscription {
                if Self::insert_subscription_if_missing(&mut tx, subscription).await? {
                    if let Some(next) = plan.stale_backfill(&current, Utc::now()) {
                        Self::write_entitlement(&mut tx, &next).await?;
                    }
                }
            }
            tx.commit()
                .await
                .map_err(|e| db_error("Failed to commit stale marker", e))?;
            timer.observe_duration();
            return Ok(CommitOutcome::Stale);
        }

        let mut next = match &plan.patch {
            Some(patch) => patch.apply(&current, Utc::now()),
            None => current.clone(),
        };
        next.last_applied_event_ts = plan.next_watermark(current.last_applied_event_ts);
        if next != current {
            Self::write_entitlement(&mut tx, &next).await?;
        }

        if let Some(subscription) = &plan.subscription {
            Self::upsert_subscription(&mut tx, subscription).await?;
        }

        if let Some(usage) = &plan.usage {
            Self::insert_usage(&mut tx, usage).await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit plan", e))?;

        timer.observe_duration();
        Ok(CommitOutcome::Applied)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn reserve_quota(&self, user_id: &str) -> Result<Reservation, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reserve_quota"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let reserved: Option<(i32, Option<String>)> = sqlx::query_as(
            r#"
            UPDATE entitlements
            SET quota_remaining = quota_remaining - 1, updated_utc = NOW()
            WHERE user_id = $1
              AND quota_remaining > 0
              AND quota_limit <> -1
              AND (tier = 'free' OR status IN ('active', 'trialing', 'past_due'))
            RETURNING quota_remaining, external_subscription_id
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to reserve quota", e))?;

        let Some((remaining, subscription_id)) = reserved else {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back reservation", e))?;
            timer.observe_duration();
            return Ok(Reservation::Exhausted);
        };

        Self::insert_usage(
            &mut tx,
            &RecordUsage {
                user_id: user_id.to_string(),
                subscription_id,
                usage_type: UsageType::AnalysisCreated,
                quantity: 1,
                metadata: Some(serde_json::json!({ "remaining_after": remaining })),
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit reservation", e))?;

        timer.observe_duration();
        Ok(Reservation::Reserved { remaining })
    }

    #[instrument(skip(self, usage), fields(user_id = %usage.user_id, usage_type = %usage.usage_type.as_str()))]
    async fn append_usage(&self, usage: &RecordUsage) -> Result<UsageRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_usage"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        let record = Self::insert_usage(&mut tx, usage).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit usage record", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT record_id, user_id, subscription_id, usage_type, quantity, timestamp, metadata
            FROM usage_records
            WHERE user_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list usage records", e))?;

        timer.observe_duration();
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn increment_rate_counter(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_rate_counter"])
            .start_timer();

        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_limit_counters (counter_key, window_start, count, expires_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (counter_key, window_start)
            DO UPDATE SET count = rate_limit_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(window_start)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to increment rate counter", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn prune(
        &self,
        processed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PruneStats, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["prune"])
            .start_timer();

        let events = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(processed_before)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to prune processed events", e))?;

        let counters = sqlx::query("DELETE FROM rate_limit_counters WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to prune rate counters", e))?;

        timer.observe_duration();

        let stats = PruneStats {
            processed_events: events.rows_affected(),
            rate_counters: counters.rows_affected(),
        };
        info!(
            processed_events = stats.processed_events,
            rate_counters = stats.rate_counters,
            "Pruned expired rows"
        );
        Ok(stats)
    }
}
