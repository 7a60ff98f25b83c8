//! # Database Module
//!
//! PostgreSQL holds the authoritative coupon ledger:
//!
//! - Coupon policies (promotion definitions with a fixed quota)
//! - Issued coupons and their lifecycle status
//!
//! Every other store in the system (quota counter, coupon state cache,
//! queue) is advisory. When they disagree with these tables, the tables win.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      DATABASE LAYER                             │
//! │                                                                 │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                   Connection Pool                        │   │
//! │  │                  (deadpool-postgres)                     │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                              │                                  │
//! │              ┌───────────────┴───────────────┐                  │
//! │              ▼                               ▼                  │
//! │     ┌─────────────────┐             ┌────────────────┐          │
//! │     │ coupon_policies │             │    coupons     │          │
//! │     └─────────────────┘             └────────────────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod models;
pub mod queries;

use deadpool_postgres::{Config, Pool, Runtime};
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config as TokioConfig, NoTls};
use tracing::{error, info};

use crate::error::CouponError;

/// Schema applied at start-up. Every statement is idempotent.
const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Enforces at most one coupon per (policy, user).
const ONE_COUPON_PER_USER_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS uq_coupons_policy_user
    ON coupons (coupon_policy_id, user_id)
"#;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to connect to the database
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryError(#[from] tokio_postgres::Error),

    /// Migration failed
    #[error("Migration failed: {0}")]
    MigrationError(String),

    /// A row held a value the models cannot represent
    #[error("Invalid row data: {0}")]
    InvalidData(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl DatabaseError {
    /// Whether the failure was a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DatabaseError::QueryError(e) => e.code() == Some(&SqlState::UNIQUE_VIOLATION),
            _ => false,
        }
    }
}

impl From<DatabaseError> for CouponError {
    fn from(e: DatabaseError) -> Self {
        if e.is_unique_violation() {
            return CouponError::Conflict(e.to_string());
        }
        CouponError::Internal(e.to_string())
    }
}

/// Database connection wrapper around the deadpool pool.
///
/// ## Usage
///
/// ```rust,ignore
/// let db = Database::connect("postgres://...", 10).await?;
/// db.run_migrations(true).await?;
/// ```
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Connect to PostgreSQL and verify the pool with `SELECT 1`.
    ///
    /// ## Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `max_size` - Maximum pooled connections
    pub async fn connect(database_url: &str, max_size: usize) -> Result<Self, DatabaseError> {
        info!("Connecting to database...");

        let tokio_config = database_url
            .parse::<TokioConfig>()
            .map_err(|e| DatabaseError::ConfigError(format!("Invalid database URL: {}", e)))?;

        let mut config = Config::new();

        if let Some(dbname) = tokio_config.get_dbname() {
            config.dbname = Some(dbname.to_string());
        }
        if let Some(user) = tokio_config.get_user() {
            config.user = Some(user.to_string());
        }
        if let Some(password) = tokio_config.get_password() {
            config.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(tokio_postgres::config::Host::Tcp(host)) = tokio_config.get_hosts().first() {
            config.host = Some(host.clone());
        }
        if let Some(port) = tokio_config.get_ports().first() {
            config.port = Some(*port);
        }

        config.pool = Some(deadpool_postgres::PoolConfig {
            max_size,
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        let client = pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("Database connection established (pool size {})", max_size);

        Ok(Self { pool })
    }

    /// Apply the embedded schema.
    ///
    /// The `(coupon_policy_id, user_id)` unique index is only created when
    /// the one-coupon-per-user rule is enabled.
    pub async fn run_migrations(&self, one_coupon_per_user: bool) -> Result<(), DatabaseError> {
        info!("Running database migrations...");

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        if let Err(e) = client.batch_execute(INITIAL_SCHEMA).await {
            let detail = e
                .as_db_error()
                .and_then(|db_err| db_err.detail())
                .unwrap_or("No detail available");
            error!("Migration execution error: {} ({})", e, detail);
            return Err(DatabaseError::MigrationError(format!("{}: {}", e, detail)));
        }

        if one_coupon_per_user {
            client
                .batch_execute(ONE_COUPON_PER_USER_INDEX)
                .await
                .map_err(|e| DatabaseError::MigrationError(e.to_string()))?;
            info!("One-coupon-per-user index in place");
        }

        info!("Migrations completed successfully");
        Ok(())
    }

    /// Check out a pooled client.
    pub async fn client(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        self.pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))
    }
}

pub use models::*;
