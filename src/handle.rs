//! Connection handle
//!
//! A [`ConnectionHandle`] is the named, logical connection callers work with
//! ("primary", "replica"). It holds at most one live session at a time and
//! hands it out through [`ConnectionHandle::with_connection`], which settles
//! the session on every exit path:
//!
//! * success: commit (autocommit only); pooled sessions go back to the pool
//! * interface failure: the session is discarded, never returned to the pool
//! * any other failure: rollback, which also returns pooled sessions
//!
//! Direct (unpooled) handles keep their session open between scopes.
//!
//! A handle is meant to be driven by one task at a time; `with_connection`
//! takes `&mut self`. Give each worker its own handle (see
//! [`ConnectionHandle::sibling`]) and share sessions through the pool.

use crate::columns::normalize_columns;
use crate::config::{ConnectionConfig, PoolConfig};
use crate::driver::{open_connection, ConnectArgs, Driver, DriverConnection, ExecuteOptions, Lexicon, ResultSet};
use crate::metrics::{counters, histograms};
use crate::pool::{BoundedPool, PoolAdapter};
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Named logical connection
pub struct ConnectionHandle<D: Driver> {
    name: String,
    config: Arc<ConnectionConfig>,
    driver: Arc<D>,
    lexicon: D::Lexicon,
    pool: Option<Arc<dyn PoolAdapter<D::Connection>>>,
    connect_args: ConnectArgs,
    autocommit: bool,
    connection: Option<D::Connection>,
}

impl<D: Driver> ConnectionHandle<D> {
    /// Create a handle; a `pool_config` switches it into pooled mode
    ///
    /// In pooled mode the handle gets its own [`BoundedPool`]. To share one
    /// pool between handles use [`ConnectionHandle::with_pool`] or
    /// [`ConnectionHandle::sibling`].
    pub fn new(
        name: impl Into<String>,
        config: Arc<ConnectionConfig>,
        driver: impl Into<Arc<D>>,
        pool_config: Option<PoolConfig>,
    ) -> Result<Self> {
        let driver = driver.into();
        let connect_args = ConnectArgs::from_config(&config, driver.connect_args());
        let pool = match pool_config {
            Some(pool_config) => {
                let pool = BoundedPool::new(Arc::clone(&driver), connect_args.clone(), pool_config)?;
                Some(Arc::new(pool) as Arc<dyn PoolAdapter<D::Connection>>)
            }
            None => None,
        };
        Ok(Self::assemble(name.into(), config, driver, pool, connect_args))
    }

    /// Create a handle that owns one persistent session
    pub fn direct(
        name: impl Into<String>,
        config: Arc<ConnectionConfig>,
        driver: impl Into<Arc<D>>,
    ) -> Self {
        let driver = driver.into();
        let connect_args = ConnectArgs::from_config(&config, driver.connect_args());
        Self::assemble(name.into(), config, driver, None, connect_args)
    }

    /// Create a handle that borrows sessions from `pool`
    pub fn with_pool(
        name: impl Into<String>,
        config: Arc<ConnectionConfig>,
        driver: impl Into<Arc<D>>,
        pool: Arc<dyn PoolAdapter<D::Connection>>,
    ) -> Self {
        let driver = driver.into();
        let connect_args = ConnectArgs::from_config(&config, driver.connect_args());
        Self::assemble(name.into(), config, driver, Some(pool), connect_args)
    }

    fn assemble(
        name: String,
        config: Arc<ConnectionConfig>,
        driver: Arc<D>,
        pool: Option<Arc<dyn PoolAdapter<D::Connection>>>,
        connect_args: ConnectArgs,
    ) -> Self {
        Self {
            name,
            config,
            driver,
            lexicon: D::Lexicon::default(),
            pool,
            connect_args,
            autocommit: true,
            connection: None,
        }
    }

    /// New handle sharing this one's configuration, driver and pool
    ///
    /// The sibling starts without a session and with autocommit enabled.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::assemble(
            name.into(),
            Arc::clone(&self.config),
            Arc::clone(&self.driver),
            self.pool.clone(),
            self.connect_args.clone(),
        )
    }

    /// Handle name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Driver strategy
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Query renderer
    pub fn lexicon(&self) -> &D::Lexicon {
        &self.lexicon
    }

    /// Arguments used for direct connections
    pub fn connect_args(&self) -> &ConnectArgs {
        &self.connect_args
    }

    /// Whether sessions come from a pool
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Whether a session is currently held
    pub fn is_held(&self) -> bool {
        self.connection.is_some()
    }

    /// Autocommit flag
    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Enable or disable autocommit
    ///
    /// With autocommit off, scopes neither commit nor release: the session
    /// stays held until a rollback, an interface failure or [`Self::close`].
    pub fn set_autocommit(&mut self, enabled: bool) {
        self.autocommit = enabled;
    }

    /// Run `f` with a live session
    ///
    /// Connects lazily, then settles the session when `f` finishes: commit on
    /// success, discard on an interface failure, rollback on any other
    /// failure. A commit is attempted at scope exit on every path; it does
    /// nothing once the session has been released or discarded. Errors from
    /// that bookkeeping on a failure path are logged and the original error is
    /// returned.
    ///
    /// `f` must own everything it captures (move clones into the closure).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example(
    /// #     handle: &mut fraiseql_conn::ConnectionHandle<fraiseql_conn::postgres::PgDriver>,
    /// # ) -> fraiseql_conn::Result<()> {
    /// let rows = handle
    ///     .with_connection(|conn| {
    ///         Box::pin(async move {
    ///             conn.execute("INSERT INTO audit (event) VALUES ('login')").await?;
    ///             conn.execute("SELECT count(*) FROM audit").await
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_connection<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut D::Connection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let span = tracing::debug_span!(
            "with_connection",
            handle = %self.name,
            pooled = self.pool.is_some()
        );
        async move {
            let scope_start = Instant::now();
            let conn = self.checkout().await?;

            let result = match f(conn).await {
                Ok(value) => self.finish_scope().await.map(|()| value),
                Err(err) => {
                    self.recover(&err).await;
                    if let Err(exit_err) = self.finish_scope().await {
                        tracing::warn!(error = %exit_err, "commit at scope exit failed");
                    }
                    Err(err)
                }
            };

            let outcome = if result.is_ok() { "ok" } else { "error" };
            histograms::scope_duration(
                &self.name,
                outcome,
                scope_start.elapsed().as_millis() as u64,
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Render `parts` with the lexicon and run the statement in a scope
    pub async fn execute(&mut self, parts: &[&str], options: ExecuteOptions) -> Result<ResultSet> {
        let sql = self.lexicon.render(parts);
        let driver = Arc::clone(&self.driver);
        tracing::debug!(handle = %self.name, write = options.write, sql = %sql, "execute");
        counters::statement(&self.name, options.write);

        self.with_connection(move |conn| {
            Box::pin(async move { driver.execute(conn, &sql, &options).await })
        })
        .await
    }

    /// Column names of `result`, lowercased when the configuration asks for it
    pub fn columns(&self, result: &ResultSet) -> Vec<String> {
        normalize_columns(result.columns.as_deref(), self.config.lowercase_columns)
    }

    /// Rows of `result` as JSON objects keyed by [`Self::columns`]
    pub fn rows_as_json(&self, result: &ResultSet) -> Vec<serde_json::Value> {
        result.to_json(&self.columns(result))
    }

    /// Obtain a fresh session from the pool, or open one directly
    ///
    /// Does not touch the held session. Failures are [`Error::Connection`].
    pub async fn connect(&self) -> Result<D::Connection> {
        match &self.pool {
            Some(pool) => pool.acquire().await.map_err(|err| match err {
                err @ Error::Connection { .. } => err,
                other => Error::connection_caused_by(
                    format!("could not acquire a connection for '{}'", self.name),
                    other,
                ),
            }),
            None => open_connection(self.driver.as_ref(), &self.connect_args).await,
        }
    }

    /// Commit the held session
    ///
    /// Does nothing when autocommit is off. Otherwise commits and, when
    /// pooled, returns the session to the pool. Fails with
    /// [`Error::NoActiveConnection`] when no session is held.
    pub async fn commit(&mut self) -> Result<()> {
        if !self.autocommit {
            return Ok(());
        }
        let conn = self.held()?;
        if let Err(err) = conn.commit().await {
            return Err(self.settle_failed(err));
        }
        counters::commit(&self.name);
        self.release();
        Ok(())
    }

    /// Roll back the held session
    ///
    /// Runs regardless of autocommit; when pooled, returns the session to
    /// the pool. Fails with [`Error::NoActiveConnection`] when no session is
    /// held, so a second rollback on a pooled handle is an error while a
    /// direct handle rolls back its session again.
    pub async fn rollback(&mut self) -> Result<()> {
        let conn = self.held()?;
        if let Err(err) = conn.rollback().await {
            return Err(self.settle_failed(err));
        }
        counters::rollback(&self.name);
        self.release();
        Ok(())
    }

    /// Roll back and give up the held session, if any
    pub async fn close(mut self) -> Result<()> {
        if self.connection.is_none() {
            return Ok(());
        }
        let result = self.rollback().await;
        // Direct sessions are still held after a rollback
        self.invalidate();
        result
    }

    async fn checkout(&mut self) -> Result<&mut D::Connection> {
        let conn = match self.connection.take() {
            Some(conn) => conn,
            None => {
                let acquire_start = Instant::now();
                let conn = self.connect().await?;
                histograms::acquire_duration(
                    &self.name,
                    acquire_start.elapsed().as_millis() as u64,
                );
                counters::connection_acquired(&self.name, self.pool.is_some());
                conn
            }
        };
        Ok(self.connection.insert(conn))
    }

    fn held(&mut self) -> Result<&mut D::Connection> {
        match self.connection.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(Error::NoActiveConnection {
                handle: self.name.clone(),
            }),
        }
    }

    /// Bookkeeping after `f` failed
    async fn recover(&mut self, err: &Error) {
        counters::scope_error(&self.name, err.category_label());
        if self.driver.is_interface_error(err) {
            tracing::warn!(handle = %self.name, error = %err, "session unusable, discarding");
            self.invalidate();
            return;
        }
        tracing::debug!(handle = %self.name, error = %err, "scope failed, rolling back");
        if let Err(rollback_err) = self.rollback().await {
            tracing::warn!(
                handle = %self.name,
                error = %rollback_err,
                "rollback after failed scope failed"
            );
        }
    }

    /// Commit attempted at every scope exit; a no-op once nothing is held
    async fn finish_scope(&mut self) -> Result<()> {
        if self.connection.is_none() {
            return Ok(());
        }
        self.commit().await
    }

    /// Drop the session if `err` says it is dead, then hand `err` back
    fn settle_failed(&mut self, err: Error) -> Error {
        if self.driver.is_interface_error(&err) {
            self.invalidate();
        }
        err
    }

    /// Return the held session to the pool; direct sessions stay held
    fn release(&mut self) {
        if let Some(pool) = &self.pool {
            if let Some(conn) = self.connection.take() {
                pool.release(conn);
                counters::connection_released(&self.name);
            }
        }
    }

    /// Forget the held session without returning it to the pool
    fn invalidate(&mut self) {
        if let Some(conn) = self.connection.take() {
            match &self.pool {
                Some(pool) => pool.discard(conn),
                None => drop(conn),
            }
            counters::connection_discarded(&self.name);
        }
    }
}

impl<D: Driver> Drop for ConnectionHandle<D> {
    fn drop(&mut self) {
        // A pooled session still held here may be mid-transaction
        if self.pool.is_some() && self.connection.is_some() {
            tracing::debug!(handle = %self.name, "handle dropped while holding a session");
            self.invalidate();
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("pooled", &self.is_pooled())
            .field("autocommit", &self.autocommit)
            .field("held", &self.is_held())
            .finish()
    }
}
