//! Postgres-backed rows shared by the control plane and the metering proxy:
//! users, sessions, subscriptions, and append-only usage records.
//!
//! All access goes through [`Store`], a thin clone-able wrapper around a
//! [`sqlx::PgPool`]. Writes are single-row; the database's row-level
//! guarantees are the only locking this layer relies on.

mod labels;
mod quota;

pub use labels::generate_label;
pub use quota::{evaluate_quota, QuotaDecision, FREE_TIER_MONTHLY_TOKENS};

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    /// A unique constraint rejected the write. Session creation retries
    /// label generation when it sees this.
    #[error("unique constraint violated")]
    Conflict,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    fn from_query(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            _ => StoreError::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub workos_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub machine_id: String,
    pub label: String,
    pub connect_token: String,
    pub connect_url: String,
    pub region: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_stopped(&self) -> bool {
        self.status == SessionStatus::Stopped.as_str()
    }
}

/// Input for a session insert; ids and timestamps come from the database.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub machine_id: String,
    pub label: String,
    pub connect_token: String,
    pub connect_url: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "pro" => Plan::Pro,
            _ => Plan::Free,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn plan(&self) -> Plan {
        Plan::from_str(&self.plan)
    }
}

const SESSION_COLUMNS: &str = "id, user_id, machine_id, label, connect_token, connect_url, \
     region, status, created_at, ended_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan, stripe_customer_id, \
     stripe_subscription_id, current_period_start, current_period_end, created_at, updated_at";

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect and verify the database is reachable.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    // ---- users ----

    pub async fn get_or_create_user(&self, workos_id: &str, email: &str) -> Result<User> {
        let existing = sqlx::query_as::<_, User>(
            "SELECT id, workos_id, email, created_at FROM users WHERE workos_id = $1",
        )
        .bind(workos_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(user) = existing {
            return Ok(user);
        }

        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (workos_id, email) VALUES ($1, $2)
            ON CONFLICT (workos_id) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, workos_id, email, created_at
            "#,
        )
        .bind(workos_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_query)
    }

    pub async fn user_by_workos_id(&self, workos_id: &str) -> Result<User> {
        sqlx::query_as::<_, User>(
            "SELECT id, workos_id, email, created_at FROM users WHERE workos_id = $1",
        )
        .bind(workos_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_query)
    }

    // ---- sessions ----

    pub async fn create_session(&self, new: &NewSession) -> Result<Session> {
        let sql = format!(
            r#"
            INSERT INTO sessions (user_id, machine_id, label, connect_token, connect_url, region, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'running')
            RETURNING {SESSION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Session>(&sql)
            .bind(new.user_id)
            .bind(&new.machine_id)
            .bind(&new.label)
            .bind(&new.connect_token)
            .bind(&new.connect_url)
            .bind(&new.region)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_query)
    }

    pub async fn session_by_id(&self, id: Uuid) -> Result<Session> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_query)
    }

    /// Label lookup scoped to one user. Used by the control plane, where a
    /// label only means anything relative to its owner.
    pub async fn session_by_label(&self, user_id: Uuid, label: &str) -> Result<Session> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = $1 AND label = $2 ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, Session>(&sql)
            .bind(user_id)
            .bind(label)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_query)
    }

    /// Label lookup across all users, live sessions only. The metering proxy
    /// uses this: the label in the URL path is the caller's credential.
    pub async fn live_session_by_label(&self, label: &str) -> Result<Session> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE label = $1 AND status <> 'stopped'"
        );
        sqlx::query_as::<_, Session>(&sql)
            .bind(label)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_query)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = $1 ORDER BY created_at DESC"
        );
        Ok(sqlx::query_as::<_, Session>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Terminal transition: status becomes `stopped` and `ended_at` is set.
    /// No other state writes happen to the row afterwards.
    pub async fn mark_session_stopped(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'stopped', ended_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE usage SET session_id = NULL WHERE session_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- subscriptions ----

    pub async fn get_or_create_subscription(&self, user_id: Uuid) -> Result<Subscription> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1");
        let existing = sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(sub) = existing {
            return Ok(sub);
        }

        let sql = format!(
            r#"
            INSERT INTO subscriptions (user_id, plan) VALUES ($1, 'free')
            ON CONFLICT (user_id) DO UPDATE SET updated_at = now()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_query)
    }

    pub async fn set_stripe_customer(&self, user_id: Uuid, customer_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET stripe_customer_id = $1, updated_at = now() \
             WHERE user_id = $2",
        )
        .bind(customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn user_by_stripe_customer(&self, customer_id: &str) -> Result<Uuid> {
        let row: (Uuid,) = sqlx::query_as(
            "SELECT user_id FROM subscriptions WHERE stripe_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_query)?;
        Ok(row.0)
    }

    pub async fn activate_subscription(
        &self,
        user_id: Uuid,
        customer_id: &str,
        subscription_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan = 'pro', stripe_customer_id = $1, stripe_subscription_id = $2,
                current_period_start = $3, current_period_end = $4, updated_at = now()
            WHERE user_id = $5
            "#,
        )
        .bind(customer_id)
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Downgrade keeps the Stripe ids around so a later re-subscription can
    /// reuse the same customer.
    pub async fn set_plan(&self, user_id: Uuid, plan: Plan) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET plan = $1, updated_at = now() WHERE user_id = $2")
            .bind(plan.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_subscription_period(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET current_period_start = $1, current_period_end = $2, \
             updated_at = now() WHERE user_id = $3",
        )
        .bind(period_start)
        .bind(period_end)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- usage ----

    /// Append one usage row. Rows are never updated or deleted.
    pub async fn record_usage(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage (user_id, session_id, input_tokens, output_tokens) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(input_tokens)
        .bind(output_tokens)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Month-to-date token totals for one user: (input, output).
    pub async fn monthly_usage(&self, user_id: Uuid) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(input_tokens), 0)::BIGINT, COALESCE(SUM(output_tokens), 0)::BIGINT
            FROM usage
            WHERE user_id = $1 AND created_at >= date_trunc('month', now())
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// The quota predicate shared by the control plane (create gate) and the
    /// metering proxy (per-request gate).
    pub async fn check_quota(&self, user_id: Uuid) -> Result<QuotaDecision> {
        let sub = self.get_or_create_subscription(user_id).await?;
        if sub.plan() == Plan::Pro {
            return Ok(QuotaDecision::Allowed { remaining: None });
        }
        let (input, output) = self.monthly_usage(user_id).await?;
        Ok(evaluate_quota(input + output))
    }
}
