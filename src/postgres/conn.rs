//! Postgres session

use super::protocol::constants::{tx_status, PROTOCOL_VERSION};
use super::protocol::{
    decode_message, encode_message, AuthenticationMessage, BackendMessage, FieldDescription,
    FrontendMessage,
};
use super::scram::{ScramClient, MECHANISM as SCRAM_MECHANISM};
use super::state::ConnectionState;
use super::transport::Transport;
use crate::driver::{Column, ConnectArgs, DriverConnection, ResultSet};
use crate::metrics::labels;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::time::Instant;
use tracing::Instrument;

/// A single authenticated Postgres session speaking the simple query protocol
///
/// Statements run inside an explicit transaction: [`PgConnection::execute`]
/// opens one with `BEGIN` when none is active, and it stays open until
/// [`DriverConnection::commit`] or [`DriverConnection::rollback`].
#[derive(Debug)]
pub struct PgConnection {
    transport: Transport,
    state: ConnectionState,
    read_buf: BytesMut,
    backend_pid: Option<i32>,
    secret_key: Option<i32>,
    tx_status: u8,
    parameters: HashMap<String, String>,
}

impl PgConnection {
    /// Open a session and authenticate
    ///
    /// `args.positional` entries are `key=value` startup parameters
    /// (`application_name=api`, `search_path=app`, ...).
    pub async fn connect(args: &ConnectArgs) -> Result<Self> {
        let params = startup_params(args)?;
        let transport = Transport::connect(args).await?;
        let mut conn = Self {
            transport,
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(8192),
            backend_pid: None,
            secret_key: None,
            tx_status: tx_status::IDLE,
            parameters: HashMap::new(),
        };

        conn.startup(params, args.password.as_deref())
            .instrument(tracing::info_span!(
                "startup",
                user = %args.user,
                database = %args.database
            ))
            .await?;
        Ok(conn)
    }

    async fn startup(
        &mut self,
        params: Vec<(String, String)>,
        password: Option<&str>,
    ) -> Result<()> {
        self.state.transition(ConnectionState::AwaitingAuth)?;
        self.send_message(&FrontendMessage::Startup {
            version: PROTOCOL_VERSION,
            params,
        })
        .await?;

        self.authenticate(password).await?;
        self.state.transition(ConnectionState::Idle)?;
        tracing::info!(backend_pid = ?self.backend_pid, "startup complete");
        Ok(())
    }

    /// Answer authentication requests until the server is ready
    async fn authenticate(&mut self, password: Option<&str>) -> Result<()> {
        let auth_start = Instant::now();
        let mut mechanism = labels::MECHANISM_TRUST;

        loop {
            match self.receive_message().await? {
                BackendMessage::Authentication(AuthenticationMessage::Ok) => {
                    crate::metrics::histograms::auth_duration(
                        mechanism,
                        auth_start.elapsed().as_millis() as u64,
                    );
                    tracing::debug!(mechanism, "authentication successful");
                    // Parameters and key data follow before ReadyForQuery
                }
                BackendMessage::Authentication(AuthenticationMessage::CleartextPassword) => {
                    mechanism = labels::MECHANISM_CLEARTEXT;
                    self.begin_auth(mechanism)?;
                    let password = require_password(password)?;
                    self.send_message(&FrontendMessage::Password(password.to_string()))
                        .await?;
                }
                BackendMessage::Authentication(AuthenticationMessage::Sasl { mechanisms }) => {
                    mechanism = labels::MECHANISM_SCRAM;
                    self.begin_auth(mechanism)?;
                    self.scram_exchange(&mechanisms, require_password(password)?)
                        .await?;
                }
                BackendMessage::Authentication(AuthenticationMessage::Md5Password { .. }) => {
                    return Err(Error::Authentication(
                        "MD5 authentication is not supported; use SCRAM-SHA-256".into(),
                    ));
                }
                BackendMessage::Authentication(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected authentication message: {:?}",
                        other
                    )));
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = Some(process_id);
                    self.secret_key = Some(secret_key);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::trace!(%name, %value, "parameter status");
                    self.parameters.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!(%notice, "notice during startup");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse(fields) => {
                    let invalid_credentials = fields
                        .code
                        .as_deref()
                        .map_or(false, |code| code.starts_with("28"));
                    return Err(if invalid_credentials {
                        Error::Authentication(fields.to_string())
                    } else {
                        fields.into_error()
                    });
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other
                    )));
                }
            }
        }
    }

    fn begin_auth(&mut self, mechanism: &'static str) -> Result<()> {
        crate::metrics::counters::auth_attempted(mechanism);
        self.state.transition(ConnectionState::Authenticating)
    }

    /// SCRAM-SHA-256 exchange, from SASLInitialResponse to SASLFinal
    async fn scram_exchange(&mut self, mechanisms: &[String], password: &str) -> Result<()> {
        if !mechanisms.iter().any(|m| m == SCRAM_MECHANISM) {
            return Err(Error::Authentication(format!(
                "server offers no supported SASL mechanism: {}",
                mechanisms.join(", ")
            )));
        }

        let scram = ScramClient::new(password);
        self.send_message(&FrontendMessage::SaslInitialResponse {
            mechanism: SCRAM_MECHANISM.to_string(),
            data: scram.client_first().into_bytes(),
        })
        .await?;

        let server_first = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue { data }) => data,
            BackendMessage::ErrorResponse(fields) => {
                return Err(Error::Authentication(fields.to_string()))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL continue, got {:?}",
                    other
                )))
            }
        };
        let server_first = String::from_utf8(server_first)
            .map_err(|_| Error::Protocol("server first message is not UTF-8".into()))?;

        let (client_final, scram_state) = scram
            .client_final(&server_first)
            .map_err(|e| Error::Authentication(e.to_string()))?;
        self.send_message(&FrontendMessage::SaslResponse(client_final.into_bytes()))
            .await?;

        let server_final = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal { data }) => data,
            BackendMessage::ErrorResponse(fields) => {
                return Err(Error::Authentication(fields.to_string()))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL final, got {:?}",
                    other
                )))
            }
        };
        let server_final = String::from_utf8(server_final)
            .map_err(|_| Error::Protocol("server final message is not UTF-8".into()))?;

        scram
            .verify_server_final(&server_final, &scram_state)
            .map_err(|e| Error::Authentication(e.to_string()))
    }

    /// Run one query string and collect one result set per statement
    ///
    /// A statement error is returned only after the server reports it is
    /// ready again, so the session stays usable. A failure of the stream
    /// itself marks the session broken.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<ResultSet>> {
        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::Broken => {
                return Err(Error::Interface("connection is broken".into()))
            }
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            // An earlier query was abandoned mid-response; the stream is out of sync
            other => {
                tracing::warn!(state = %other, backend_pid = ?self.backend_pid, "connection out of sync");
                self.state = ConnectionState::Broken;
                return Err(Error::Interface(format!(
                    "previous query was interrupted while {}",
                    other
                )));
            }
        }

        let outcome = self.run_query(sql).await;
        if let Err(err) = &outcome {
            if err.is_interface() {
                tracing::warn!(error = %err, backend_pid = ?self.backend_pid, "connection broken");
                self.state = ConnectionState::Broken;
            }
        }
        outcome
    }

    async fn run_query(&mut self, sql: &str) -> Result<Vec<ResultSet>> {
        self.state.transition(ConnectionState::QueryInProgress)?;
        self.send_message(&FrontendMessage::Query(sql.to_string()))
            .await?;
        self.state.transition(ConnectionState::ReadingResults)?;

        let mut results = Vec::new();
        let mut current = ResultSet::default();
        let mut statement_error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription(fields) => {
                    current.columns = Some(fields.into_iter().map(column).collect());
                }
                BackendMessage::DataRow(cells) => {
                    current.rows.push(
                        cells
                            .into_iter()
                            .map(|cell| cell.map(|b| String::from_utf8_lossy(&b).into_owned()))
                            .collect(),
                    );
                }
                BackendMessage::CommandComplete(tag) => {
                    current.set_command_tag(tag);
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::EmptyQueryResponse => {
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::ErrorResponse(fields) => {
                    if fields.is_session_fatal() {
                        return Err(fields.into_error());
                    }
                    statement_error.get_or_insert(fields.into_error());
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!(%notice, "notice");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::NotificationResponse { process_id, channel, .. } => {
                    tracing::debug!(process_id, %channel, "notification ignored");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    break;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in query response: {:?}",
                        other
                    )));
                }
            }
        }

        self.state.transition(ConnectionState::Idle)?;
        match statement_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Run `sql` inside the current transaction, opening one if needed
    ///
    /// Returns the result of the last statement in `sql`.
    pub async fn execute(&mut self, sql: &str) -> Result<ResultSet> {
        if self.tx_status == tx_status::IDLE {
            self.simple_query("BEGIN").await?;
        }
        let mut results = self.simple_query(sql).await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Current protocol state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a transaction block is open (or failed and awaiting rollback)
    pub fn in_transaction(&self) -> bool {
        self.tx_status != tx_status::IDLE
    }

    /// Server process ID, for cancellation and log correlation
    pub fn backend_pid(&self) -> Option<i32> {
        self.backend_pid
    }

    /// A parameter the server reported (`server_version`, `TimeZone`, ...)
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Send Terminate and shut the socket down
    pub async fn close(mut self) -> Result<()> {
        self.state.transition(ConnectionState::Closed)?;
        let _ = self.send_message(&FrontendMessage::Terminate).await;
        self.transport.shutdown().await?;
        Ok(())
    }

    async fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let buf = encode_message(msg);
        self.transport.write_all(&buf).await?;
        self.transport.flush().await?;
        Ok(())
    }

    async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some((msg, consumed)) = decode_message(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return Ok(msg);
            }

            let n = self.transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

#[async_trait]
impl DriverConnection for PgConnection {
    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction() {
            return Ok(());
        }
        let results = self.simple_query("COMMIT").await?;
        // COMMIT of a failed transaction block rolls back and reports ROLLBACK
        let rolled_back = results
            .last()
            .and_then(|r| r.command_tag.as_deref())
            .map_or(false, |tag| tag == "ROLLBACK");
        if rolled_back {
            return Err(Error::Operation(
                "transaction was aborted and has been rolled back".into(),
            ));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.simple_query("ROLLBACK").await?;
        Ok(())
    }
}

fn column(field: FieldDescription) -> Column {
    Column {
        name: field.name,
        type_oid: field.type_oid,
    }
}

fn require_password(password: Option<&str>) -> Result<&str> {
    password.ok_or_else(|| Error::Authentication("server requested a password".into()))
}

/// Startup parameters: user, database, then each `key=value` positional arg
fn startup_params(args: &ConnectArgs) -> Result<Vec<(String, String)>> {
    let mut params = vec![
        ("user".to_string(), args.user.clone()),
        ("database".to_string(), args.database.clone()),
    ];
    for arg in &args.positional {
        match arg.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                params.push((key.trim().to_string(), value.to_string()));
            }
            _ => {
                return Err(Error::Config(format!(
                    "connect argument '{}' is not a key=value startup parameter",
                    arg
                )))
            }
        }
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn args(positional: &[&str]) -> ConnectArgs {
        ConnectArgs::from_config(
            &ConnectionConfig::new("app", "svc"),
            positional.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_startup_params_include_positional() {
        let params = startup_params(&args(&["application_name=api", "search_path=a,b"])).unwrap();
        assert_eq!(
            params,
            vec![
                ("user".to_string(), "svc".to_string()),
                ("database".to_string(), "app".to_string()),
                ("application_name".to_string(), "api".to_string()),
                ("search_path".to_string(), "a,b".to_string()),
            ]
        );
    }

    #[test]
    fn test_startup_params_reject_bare_values() {
        let err = startup_params(&args(&["verbose"])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(startup_params(&args(&["=x"])).is_err());
    }

    #[test]
    fn test_require_password() {
        assert_eq!(require_password(Some("pw")).unwrap(), "pw");
        assert!(matches!(
            require_password(None),
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn test_pg_connection_is_send() {
        fn require_send<T: Send>() {}
        require_send::<PgConnection>();
    }
}
