//! Protocol message types

use crate::Error;
use bytes::Bytes;

/// Frontend message (client → server)
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Startup message
    Startup {
        /// Protocol version
        version: i32,
        /// Startup parameters (`user`, `database`, ...)
        params: Vec<(String, String)>,
    },

    /// Cleartext password
    Password(String),

    /// First SASL message, naming the mechanism
    SaslInitialResponse {
        /// Mechanism name (e.g., "SCRAM-SHA-256")
        mechanism: String,
        /// Client first message
        data: Vec<u8>,
    },

    /// Subsequent SASL message
    SaslResponse(Vec<u8>),

    /// Simple query
    Query(String),

    /// Terminate
    Terminate,
}

/// Backend message (server → client)
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationMessage),

    /// Backend key data (for cancellation)
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Command complete, with its tag
    CommandComplete(String),

    /// Data row; `None` is SQL NULL
    DataRow(Vec<Option<Bytes>>),

    /// Response to an empty query string
    EmptyQueryResponse,

    /// Error response
    ErrorResponse(ErrorFields),

    /// Notice response
    NoticeResponse(ErrorFields),

    /// Asynchronous `NOTIFY` delivery
    NotificationResponse {
        /// Notifying backend
        process_id: i32,
        /// Channel name
        channel: String,
        /// Payload
        payload: String,
    },

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Ready for query
    ReadyForQuery {
        /// Transaction status
        status: u8,
    },

    /// Row description
    RowDescription(Vec<FieldDescription>),
}

/// Authentication message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage {
    /// Authentication OK
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 hash
        salt: [u8; 4],
    },

    /// SASL mechanisms offered by the server
    Sasl {
        /// Mechanism names (e.g., ["SCRAM-SHA-256"])
        mechanisms: Vec<String>,
    },

    /// SASL server challenge
    SaslContinue {
        /// Server first message
        data: Vec<u8>,
    },

    /// SASL outcome
    SaslFinal {
        /// Server final message
        data: Vec<u8>,
    },
}

/// Field description (column metadata)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: i32,
    /// Column attribute number (0 if not a table column)
    pub column_attr: i16,
    /// Data type OID
    pub type_oid: u32,
    /// Data type size
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format code (0 = text, 1 = binary)
    pub format_code: i16,
}

/// Error/notice fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity (ERROR, FATAL, WARNING, ...)
    pub severity: Option<String>,
    /// SQLSTATE code
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
    /// Position in query string
    pub position: Option<String>,
}

impl ErrorFields {
    /// Whether the SQLSTATE says the session is gone
    ///
    /// Class 08 (connection exception) and 57P01..57P03 (server shutting
    /// down or not accepting connections).
    pub fn is_session_fatal(&self) -> bool {
        match self.code.as_deref() {
            Some(code) => {
                code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
            }
            None => false,
        }
    }

    /// Convert into a crate error
    pub fn into_error(self) -> Error {
        if self.is_session_fatal() {
            return Error::Interface(self.to_string());
        }
        let mut message = self.message.unwrap_or_else(|| "unknown server error".into());
        if let Some(detail) = self.detail {
            message.push_str(": ");
            message.push_str(&detail);
        }
        Error::Sql {
            code: self.code,
            message,
        }
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref msg) = self.message {
            write!(f, "{}", msg)?;
        }
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        Ok(())
    }
}
