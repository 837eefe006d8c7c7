//! Per-profile Postgres connection pooling.
//!
//! [`PoolRegistry`] owns one bounded `PgPool` per connection profile,
//! created lazily on first use and probed with a trivial round-trip before
//! being trusted. A background sweep closes pools that have gone unused
//! beyond the idle window, independently of request handling. The registry
//! is an explicit, injectable value with its own shutdown lifecycle so
//! tests can run isolated instances side by side.
//!
//! Pools are keyed by profile id and never shared across owners.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SandboxConfig;
use crate::models::ConnectionProfile;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid connection string: {0}")]
    InvalidDsn(String),

    #[error("connection probe failed: {0}")]
    Probe(String),

    #[error("connection probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("pool registry owner mismatch for profile {0}")]
    OwnerMismatch(String),

    #[error("pool registry is shut down")]
    Shutdown,
}

struct PoolEntry {
    pool: PgPool,
    owner_id: String,
    last_used: Instant,
}

/// Snapshot of one pooled profile, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub profile_id: String,
    pub connections: u32,
    pub idle_connections: usize,
    pub idle_for: Duration,
}

/// Registry of per-profile connection pools with idle eviction.
pub struct PoolRegistry {
    config: SandboxConfig,
    pools: Mutex<HashMap<String, PoolEntry>>,
    shutdown: Notify,
    closed: Mutex<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolRegistry {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
            closed: Mutex::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the background sweep task. Idempotent; the task runs until
    /// [`close_all`](Self::close_all).
    pub async fn start_sweeper(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock().await;
        if guard.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = registry.shutdown.notified() => break,
                    _ = ticker.tick() => {
                        registry.sweep_once().await;
                    }
                }
            }
        }));
    }

    /// Return the pool for a profile, creating and probing it on first use.
    ///
    /// The caller supplies the already-decrypted DSN; the registry never
    /// stores it, only the live pool built from it.
    pub async fn get_pool(&self, profile: &ConnectionProfile, dsn: &str) -> PoolResult<PgPool> {
        if *self.closed.lock().await {
            return Err(PoolError::Shutdown);
        }

        {
            let mut pools = self.pools.lock().await;
            if let Some(entry) = pools.get_mut(&profile.id) {
                if entry.owner_id != profile.owner_id {
                    return Err(PoolError::OwnerMismatch(profile.id.clone()));
                }
                entry.last_used = Instant::now();
                return Ok(entry.pool.clone());
            }
        }

        // Build outside the lock: pool construction is lazy, but the probe
        // is a real round-trip we must not serialize other profiles behind.
        let pool = self.build_pool(dsn)?;
        self.probe(&pool).await?;

        let mut pools = self.pools.lock().await;
        if let Some(entry) = pools.get_mut(&profile.id) {
            // Lost a creation race; keep the established entry.
            pool.close().await;
            entry.last_used = Instant::now();
            return Ok(entry.pool.clone());
        }
        tracing::debug!(profile_id = %profile.id, owner_id = %profile.owner_id, "opened connection pool");
        pools.insert(
            profile.id.clone(),
            PoolEntry {
                pool: pool.clone(),
                owner_id: profile.owner_id.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(pool)
    }

    fn build_pool(&self, dsn: &str) -> PoolResult<PgPool> {
        let statement_timeout = self.config.statement_timeout_ms.to_string();
        let options = PgConnectOptions::from_str(dsn)
            .map_err(|e| PoolError::InvalidDsn(e.to_string()))?
            // Server-side guard; the executor adds a client-side backstop.
            .options([("statement_timeout", statement_timeout.as_str())]);

        Ok(PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(self.config.idle_timeout_secs))
            .test_before_acquire(true)
            .connect_lazy_with(options))
    }

    async fn probe(&self, pool: &PgPool) -> PoolResult<()> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(pool)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                pool.close().await;
                Err(PoolError::Probe(e.to_string()))
            }
            Err(_) => {
                pool.close().await;
                Err(PoolError::ProbeTimeout(timeout))
            }
        }
    }

    /// Evict and close every pool unused beyond the max-idle window.
    pub async fn sweep_once(&self) {
        let max_idle = Duration::from_secs(self.config.max_pool_idle_secs);
        let now = Instant::now();

        let expired: Vec<(String, PoolEntry)> = {
            let mut pools = self.pools.lock().await;
            let ids: Vec<String> = pools
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_used) > max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pools.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in expired {
            tracing::debug!(profile_id = %id, "evicting idle connection pool");
            entry.pool.close().await;
        }
    }

    /// Snapshot of every live pool.
    pub async fn stats(&self) -> Vec<PoolStats> {
        let now = Instant::now();
        let pools = self.pools.lock().await;
        pools
            .iter()
            .map(|(id, e)| PoolStats {
                profile_id: id.clone(),
                connections: e.pool.size(),
                idle_connections: e.pool.num_idle(),
                idle_for: now.duration_since(e.last_used),
            })
            .collect()
    }

    /// Drain every pool and cancel the sweep. Safe to call more than once.
    pub async fn close_all(&self) {
        {
            let mut closed = self.closed.lock().await;
            if *closed {
                return;
            }
            *closed = true;
        }

        self.shutdown.notify_waiters();
        if let Some(mut handle) = self.sweeper.lock().await.take() {
            // Bounded drain: the sweep loop exits on notify; don't hang
            // shutdown if it is mid-eviction.
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                tracing::warn!("sweep task did not stop in time; aborted");
            }
        }

        let entries: Vec<PoolEntry> = {
            let mut pools = self.pools.lock().await;
            pools.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_config() -> SandboxConfig {
        SandboxConfig::default()
    }

    fn lazy_pool() -> PgPool {
        let options = PgConnectOptions::from_str("postgres://probe@localhost:1/void").unwrap();
        PgPoolOptions::new().connect_lazy_with(options)
    }

    fn profile(id: &str, owner: &str) -> ConnectionProfile {
        ConnectionProfile {
            id: id.to_string(),
            owner_id: owner.to_string(),
            display_name: id.to_string(),
            encrypted_dsn: String::new(),
            created_at: Utc::now(),
        }
    }

    async fn insert_entry(registry: &PoolRegistry, id: &str, owner: &str) {
        registry.pools.lock().await.insert(
            id.to_string(),
            PoolEntry {
                pool: lazy_pool(),
                owner_id: owner.to_string(),
                last_used: Instant::now(),
            },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_pool_and_keeps_active_one() {
        let registry = PoolRegistry::new(test_config());
        insert_entry(&registry, "stale", "owner-a").await;

        tokio::time::advance(Duration::from_secs(601)).await;
        insert_entry(&registry, "fresh", "owner-a").await;

        registry.sweep_once().await;

        let stats = registry.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].profile_id, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_used_within_window_survives_sweep() {
        let registry = PoolRegistry::new(test_config());
        insert_entry(&registry, "p1", "owner-a").await;

        tokio::time::advance(Duration::from_secs(599)).await;
        registry.sweep_once().await;
        assert_eq!(registry.stats().await.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        registry.sweep_once().await;
        assert!(registry.stats().await.is_empty());
    }

    #[tokio::test]
    async fn test_cached_pool_rejects_owner_mismatch() {
        let registry = PoolRegistry::new(test_config());
        insert_entry(&registry, "p1", "owner-a").await;

        let foreign = profile("p1", "owner-b");
        let err = registry.get_pool(&foreign, "postgres://h/db").await;
        assert!(matches!(err, Err(PoolError::OwnerMismatch(_))));
    }

    #[tokio::test]
    async fn test_cached_pool_returned_without_reprobe() {
        let registry = PoolRegistry::new(test_config());
        insert_entry(&registry, "p1", "owner-a").await;

        // The DSN is not even parsed on a cache hit; an unreachable one
        // proves no new connection work happened.
        let pool = registry
            .get_pool(&profile("p1", "owner-a"), "postgres://unreachable:1/x")
            .await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_dsn_rejected() {
        let registry = PoolRegistry::new(test_config());
        let err = registry
            .get_pool(&profile("p1", "owner-a"), ":::not-a-dsn")
            .await;
        assert!(matches!(err, Err(PoolError::InvalidDsn(_))));
    }

    #[tokio::test]
    async fn test_close_all_is_terminal_and_idempotent() {
        let registry = PoolRegistry::new(test_config());
        insert_entry(&registry, "p1", "owner-a").await;

        registry.close_all().await;
        registry.close_all().await;
        assert!(registry.stats().await.is_empty());

        let err = registry
            .get_pool(&profile("p2", "owner-a"), "postgres://h/db")
            .await;
        assert!(matches!(err, Err(PoolError::Shutdown)));
    }
}
