//! Driver capability
//!
//! A backend plugs into the connection handle by implementing [`Driver`]. The
//! driver is chosen when the handle is built and owns everything that varies
//! per database: how sessions are opened, how statements run, how queries are
//! rendered ([`Lexicon`]) and which failures mean the session is dead.

use crate::columns::ColumnDescriptor;
use crate::config::ConnectionConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Connect timeout passed to every direct connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Database backend strategy
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Live session type
    type Connection: DriverConnection;

    /// Query renderer for this dialect
    type Lexicon: Lexicon;

    /// Short backend name, used in logs and metrics
    fn name(&self) -> &'static str;

    /// Positional, driver-specific connect arguments
    fn connect_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Open a new session
    async fn connect(&self, args: &ConnectArgs) -> Result<Self::Connection>;

    /// Run one statement on `conn`
    ///
    /// There is no generic implementation: drivers that support statement
    /// execution override this.
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        options: &ExecuteOptions,
    ) -> Result<ResultSet> {
        let _ = (conn, sql, options);
        Err(Error::NotImplemented(format!(
            "execute is not provided by the {} driver",
            self.name()
        )))
    }

    /// Whether `err` means the session can no longer be used
    fn is_interface_error(&self, err: &Error) -> bool {
        err.is_interface()
    }
}

/// A live session opened by a [`Driver`]
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction
    async fn rollback(&mut self) -> Result<()>;
}

/// Dialect-specific query rendering helper
///
/// Stateless; one instance lives on each handle.
pub trait Lexicon: Default + Send + Sync + 'static {
    /// Join statement fragments into a single statement
    fn render(&self, parts: &[&str]) -> String {
        parts
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Quote an identifier (table, column)
    fn quote_identifier(&self, ident: &str) -> String;

    /// Quote a string literal
    fn quote_literal(&self, value: &str) -> String;
}

/// Arguments for opening a direct connection
///
/// Assembled once from a [`ConnectionConfig`] when a handle is built.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectArgs {
    /// Driver-specific positional arguments
    pub positional: Vec<String>,
    /// Database name
    pub database: String,
    /// Username
    pub user: String,
    /// Password
    pub password: Option<String>,
    /// Host or Unix socket directory
    pub host: String,
    /// Port
    pub port: u16,
    /// Connect timeout
    pub connect_timeout: Duration,
}

impl ConnectArgs {
    /// Assemble arguments from configuration
    pub fn from_config(config: &ConnectionConfig, positional: Vec<String>) -> Self {
        Self {
            positional,
            database: config.database.clone(),
            user: config.username.clone(),
            password: config.password.clone(),
            host: config.host.clone(),
            port: config.port,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for ConnectArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectArgs")
            .field("positional", &self.positional)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Per-statement options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Statement modifies data
    pub write: bool,
}

impl ExecuteOptions {
    /// Options for a read
    pub fn read() -> Self {
        Self { write: false }
    }

    /// Options for a write
    pub fn write() -> Self {
        Self { write: true }
    }
}

/// Result-set column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name as reported by the server
    pub name: String,
    /// Type OID (0 when unknown)
    pub type_oid: u32,
}

impl ColumnDescriptor for Column {
    fn column_name(&self) -> &str {
        &self.name
    }
}

/// Outcome of one statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    /// Column metadata; `None` when the statement produced no result set
    pub columns: Option<Vec<Column>>,
    /// Rows in text format; `None` cells are SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
    /// Command tag (`INSERT 0 1`, `SELECT 3`, ...)
    pub command_tag: Option<String>,
    /// Rows affected, parsed from the command tag
    pub rows_affected: Option<u64>,
}

impl ResultSet {
    /// Record the command tag and derive the affected-row count
    pub fn set_command_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        self.rows_affected = parse_rows_affected(&tag);
        self.command_tag = Some(tag);
    }

    /// Rows as JSON objects keyed by `column_names`
    ///
    /// Pass the names from [`crate::ConnectionHandle::columns`] to honor the
    /// lowercase-columns setting.
    pub fn to_json(&self, column_names: &[String]) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let object = column_names
                    .iter()
                    .zip(row.iter())
                    .map(|(name, cell)| {
                        let value = match cell {
                            Some(text) => serde_json::Value::String(text.clone()),
                            None => serde_json::Value::Null,
                        };
                        (name.clone(), value)
                    })
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect()
    }
}

/// Open a session through `driver`, bounded by `args.connect_timeout`
///
/// Every failure is reported as [`Error::Connection`], with the driver's error
/// kept as the source.
pub(crate) async fn open_connection<D: Driver>(
    driver: &D,
    args: &ConnectArgs,
) -> Result<D::Connection> {
    let target = format!("{}@{}:{}/{}", args.user, args.host, args.port, args.database);
    match tokio::time::timeout(args.connect_timeout, driver.connect(args)).await {
        Ok(Ok(conn)) => {
            crate::metrics::counters::connection_opened(driver.name());
            tracing::debug!(driver = driver.name(), %target, "connection opened");
            Ok(conn)
        }
        Ok(Err(err @ Error::Connection { .. })) => Err(err),
        Ok(Err(err)) => Err(Error::connection_caused_by(
            format!("could not connect to {}", target),
            err,
        )),
        Err(_) => Err(Error::connection(format!(
            "timed out connecting to {} after {:?}",
            target, args.connect_timeout
        ))),
    }
}

/// Trailing row count of a command tag (`UPDATE 3` -> 3)
fn parse_rows_affected(tag: &str) -> Option<u64> {
    let mut words = tag.split_whitespace();
    let verb = words.next()?;
    match verb {
        "INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE" => {
            words.last()?.parse().ok()
        }
        _ => None,
    }
}
