//! Durable store for IP intelligence records.
//!
//! SQLite via SQLx holds the whois-derived ranges, proxy-check records,
//! referral hints, per-address bookkeeping, and the ban rows written by
//! the moderation subsystem. This is the single source of truth; the
//! volatile verdict cache in front of it is advisory.

mod models;
mod queries;

pub use models::{BanRecord, IpRange, ProxyRecord, RangeFacts, ReferralHint};
pub use queries::IntelRepository;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::IntelError;

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection, running migrations if needed.
    pub async fn new(path: &str) -> Result<Self, IntelError> {
        let pool = if path == ":memory:" {
            // Use a uniquely named shared-cache memory database per call;
            // `file::memory:` is global-ish and collides across parallel tests.
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let memdb_uri = format!(
                "file:ipintel-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );

            let options = SqliteConnectOptions::new()
                .filename(&memdb_uri)
                .shared_cache(true)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "Intelligence store connected");

        Self::run_migrations(&pool).await?;

        // WAL mode lets verdict reads proceed while a lookup write-back
        // is in progress.
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

        // Foreign keys carry the range linkage semantics.
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Get reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run embedded migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), IntelError> {
        sqlx::migrate!("./migrations").run(pool).await?;
        info!("Store migrations checked/applied");
        Ok(())
    }

    /// Get the intelligence repository.
    pub fn intel(&self) -> IntelRepository<'_> {
        IntelRepository::new(&self.pool)
    }
}

/// Periodically delete expired rows (bans, hints, proxy records).
///
/// Reads filter expiry themselves; this sweep only reclaims space so read
/// latency stays flat. Range rows are exempt: they are replaced in place
/// on refresh, never swept.
pub fn spawn_expiry_sweep(db: Database, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match db.intel().cleanup_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "Swept expired intelligence rows"),
                Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}
