//! Postgres backend
//!
//! A [`Driver`] over the Postgres v3 frontend/backend protocol: TCP or Unix
//! socket transport, trust/cleartext/SCRAM-SHA-256 authentication and the
//! simple query protocol. No TLS.

mod conn;
mod lexicon;
pub mod protocol;
pub mod scram;
mod state;
mod transport;

pub use conn::PgConnection;
pub use lexicon::PgLexicon;
pub use state::ConnectionState;
pub use transport::{socket_path, Transport};

use crate::driver::{ConnectArgs, Driver, ExecuteOptions, ResultSet};
use crate::{Error, Result};
use async_trait::async_trait;

/// Postgres [`Driver`]
#[derive(Debug, Clone, Default)]
pub struct PgDriver {
    application_name: Option<String>,
}

impl PgDriver {
    /// Driver with no extra startup parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `name` as `application_name` to the server
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Driver for PgDriver {
    type Connection = PgConnection;
    type Lexicon = PgLexicon;

    fn name(&self) -> &'static str {
        "postgres"
    }

    fn connect_args(&self) -> Vec<String> {
        self.application_name
            .iter()
            .map(|name| format!("application_name={}", name))
            .collect()
    }

    async fn connect(&self, args: &ConnectArgs) -> Result<PgConnection> {
        PgConnection::connect(args).await
    }

    async fn execute(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        options: &ExecuteOptions,
    ) -> Result<ResultSet> {
        tracing::debug!(write = options.write, backend_pid = ?conn.backend_pid(), "execute");
        conn.execute(sql).await
    }

    fn is_interface_error(&self, err: &Error) -> bool {
        err.is_interface()
            || matches!(err.sqlstate(), Some(code) if code.starts_with("08"))
    }
}
