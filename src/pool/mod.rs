//! Pool adapters
//!
//! A [`PoolAdapter`] hands out sessions and takes them back. The connection
//! handle only ever calls `acquire`, `release` and `discard`; limits, backlog
//! and reuse policy belong to the adapter.
//!
//! [`BoundedPool`] is the built-in adapter: a fixed number of slots guarded by
//! a semaphore, idle sessions reused most-recently-released first.

use crate::config::PoolConfig;
use crate::driver::{open_connection, ConnectArgs, Driver};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

/// Supplies and reclaims sessions of type `C`
#[async_trait]
pub trait PoolAdapter<C: Send + 'static>: Send + Sync {
    /// Take a session, waiting as long as the adapter allows
    ///
    /// Fails with [`Error::Connection`] when none can be provided.
    async fn acquire(&self) -> Result<C>;

    /// Return a healthy session
    fn release(&self, conn: C);

    /// Give up a session that must not be reused
    fn discard(&self, conn: C) {
        drop(conn);
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured capacity
    pub max_size: usize,
    /// Sessions waiting in the pool
    pub idle: usize,
    /// Sessions handed out and not yet returned
    pub in_use: usize,
}

/// Fixed-capacity pool that opens sessions on demand through a [`Driver`]
///
/// Only return sessions that came from this pool: `release` and `discard`
/// free one slot each.
pub struct BoundedPool<D: Driver> {
    driver: Arc<D>,
    args: ConnectArgs,
    config: PoolConfig,
    idle: Mutex<Vec<D::Connection>>,
    slots: Semaphore,
}

impl<D: Driver> BoundedPool<D> {
    /// Create an empty pool
    pub fn new(driver: Arc<D>, args: ConnectArgs, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slots: Semaphore::new(config.max_size),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            driver,
            args,
            config,
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current occupancy
    pub fn status(&self) -> PoolStatus {
        let in_use = self.config.max_size - self.slots.available_permits();
        PoolStatus {
            max_size: self.config.max_size,
            idle: self.idle().len(),
            in_use,
        }
    }

    /// Open sessions until `min_size` are idle or the pool is full
    pub async fn warm_up(&self) -> Result<()> {
        loop {
            let status = self.status();
            if status.idle >= self.config.min_size
                || status.idle + status.in_use >= self.config.max_size
            {
                return Ok(());
            }
            let conn = open_connection(self.driver.as_ref(), &self.args).await?;
            self.idle().push(conn);
        }
    }

    /// Refuse further acquisitions and drop idle sessions
    pub fn close(&self) {
        self.slots.close();
        let drained = std::mem::take(&mut *self.idle());
        tracing::debug!(idle = drained.len(), "pool closed");
    }

    fn idle(&self) -> MutexGuard<'_, Vec<D::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<D: Driver> PoolAdapter<D::Connection> for BoundedPool<D> {
    async fn acquire(&self) -> Result<D::Connection> {
        let timeout = self.config.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::connection("pool is closed")),
            Err(_) => {
                crate::metrics::counters::pool_timeout();
                tracing::warn!(max_size = self.config.max_size, ?timeout, "pool exhausted");
                return Err(Error::connection(format!(
                    "pool exhausted: no connection available within {:?}",
                    timeout
                )));
            }
        };

        let reused = self.idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            // An error here drops the permit, which frees the slot again
            None => open_connection(self.driver.as_ref(), &self.args).await?,
        };
        permit.forget();
        Ok(conn)
    }

    fn release(&self, conn: D::Connection) {
        self.idle().push(conn);
        self.slots.add_permits(1);
    }

    fn discard(&self, conn: D::Connection) {
        drop(conn);
        self.slots.add_permits(1);
    }
}

impl<D: Driver> std::fmt::Debug for BoundedPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedPool")
            .field("driver", &self.driver.name())
            .field("status", &self.status())
            .finish()
    }
}
