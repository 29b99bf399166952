//! Connection state machine

use crate::{Error, Result};

/// Protocol state of a [`PgConnection`](super::PgConnection)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Initial,

    /// Startup sent, awaiting authentication request
    AwaitingAuth,

    /// Authentication in progress
    Authenticating,

    /// Ready for query
    Idle,

    /// Query sent
    QueryInProgress,

    /// Reading query results
    ReadingResults,

    /// Stream desynchronized or dropped; only closing is allowed
    Broken,

    /// Closed
    Closed,
}

impl ConnectionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Initial, AwaitingAuth)
                | (AwaitingAuth, Authenticating)
                | (AwaitingAuth, Idle)
                | (Authenticating, Idle)
                | (Idle, QueryInProgress)
                | (QueryInProgress, ReadingResults)
                | (QueryInProgress, Idle)
                | (ReadingResults, Idle)
                | (Closed, Closed)
        ) || (next == Broken && *self != Closed)
            || (next == Closed)
    }

    /// Transition to new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Whether a query may be sent
    pub fn is_usable(&self) -> bool {
        *self == ConnectionState::Idle
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::AwaitingAuth => write!(f, "awaiting_auth"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Idle => write!(f, "idle"),
            Self::QueryInProgress => write!(f, "query_in_progress"),
            Self::ReadingResults => write!(f, "reading_results"),
            Self::Broken => write!(f, "broken"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
