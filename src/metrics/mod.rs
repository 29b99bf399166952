//! Metrics for connection lifecycle and pool activity
//!
//! Thin wrappers over the `metrics` facade. Nothing is recorded unless the
//! application installs a recorder.

/// Metric names and label values
pub mod labels {
    /// Connections opened through a driver
    pub const CONNECTIONS_OPENED: &str = "fraiseql_conn_connections_opened_total";
    /// Connections handed out by a pool
    pub const CONNECTIONS_ACQUIRED: &str = "fraiseql_conn_connections_acquired_total";
    /// Connections returned to a pool
    pub const CONNECTIONS_RELEASED: &str = "fraiseql_conn_connections_released_total";
    /// Connections thrown away after an interface failure
    pub const CONNECTIONS_DISCARDED: &str = "fraiseql_conn_connections_discarded_total";
    /// Commits issued by a handle
    pub const COMMITS: &str = "fraiseql_conn_commits_total";
    /// Rollbacks issued by a handle
    pub const ROLLBACKS: &str = "fraiseql_conn_rollbacks_total";
    /// Scoped acquisitions that ended in an error
    pub const SCOPE_ERRORS: &str = "fraiseql_conn_scope_errors_total";
    /// Statements executed
    pub const STATEMENTS: &str = "fraiseql_conn_statements_total";
    /// Pool acquisitions that timed out
    pub const POOL_TIMEOUTS: &str = "fraiseql_conn_pool_acquire_timeouts_total";
    /// Authentication attempts
    pub const AUTH_ATTEMPTED: &str = "fraiseql_conn_auth_attempted_total";

    /// Time spent obtaining a connection (ms)
    pub const ACQUIRE_DURATION: &str = "fraiseql_conn_acquire_duration_ms";
    /// Time spent inside a scoped acquisition (ms)
    pub const SCOPE_DURATION: &str = "fraiseql_conn_scope_duration_ms";
    /// Time spent authenticating (ms)
    pub const AUTH_DURATION: &str = "fraiseql_conn_auth_duration_ms";

    /// Cleartext password mechanism
    pub const MECHANISM_CLEARTEXT: &str = "cleartext";
    /// SCRAM-SHA-256 mechanism
    pub const MECHANISM_SCRAM: &str = "scram-sha-256";
    /// No password exchange (trust)
    pub const MECHANISM_TRUST: &str = "trust";
}

/// Counter helpers
pub mod counters {
    use super::labels;

    /// A driver opened a new session
    pub fn connection_opened(driver: &'static str) {
        metrics::counter!(labels::CONNECTIONS_OPENED, "driver" => driver).increment(1);
    }

    /// A handle obtained a connection
    pub fn connection_acquired(handle: &str, pooled: bool) {
        metrics::counter!(
            labels::CONNECTIONS_ACQUIRED,
            "handle" => handle.to_string(),
            "mode" => if pooled { "pooled" } else { "direct" }
        )
        .increment(1);
    }

    /// A handle gave its connection back to the pool
    pub fn connection_released(handle: &str) {
        metrics::counter!(labels::CONNECTIONS_RELEASED, "handle" => handle.to_string())
            .increment(1);
    }

    /// A handle dropped a broken connection
    pub fn connection_discarded(handle: &str) {
        metrics::counter!(labels::CONNECTIONS_DISCARDED, "handle" => handle.to_string())
            .increment(1);
    }

    /// Commit issued
    pub fn commit(handle: &str) {
        metrics::counter!(labels::COMMITS, "handle" => handle.to_string()).increment(1);
    }

    /// Rollback issued
    pub fn rollback(handle: &str) {
        metrics::counter!(labels::ROLLBACKS, "handle" => handle.to_string()).increment(1);
    }

    /// A scope failed; `category` is an error category label
    pub fn scope_error(handle: &str, category: &'static str) {
        metrics::counter!(
            labels::SCOPE_ERRORS,
            "handle" => handle.to_string(),
            "category" => category
        )
        .increment(1);
    }

    /// Statement executed through a handle
    pub fn statement(handle: &str, write: bool) {
        metrics::counter!(
            labels::STATEMENTS,
            "handle" => handle.to_string(),
            "kind" => if write { "write" } else { "read" }
        )
        .increment(1);
    }

    /// Pool acquire gave up waiting
    pub fn pool_timeout() {
        metrics::counter!(labels::POOL_TIMEOUTS).increment(1);
    }

    /// Authentication attempted with `mechanism`
    pub fn auth_attempted(mechanism: &'static str) {
        metrics::counter!(labels::AUTH_ATTEMPTED, "mechanism" => mechanism).increment(1);
    }
}

/// Histogram helpers
pub mod histograms {
    use super::labels;

    /// Time to obtain a connection
    pub fn acquire_duration(handle: &str, duration_ms: u64) {
        metrics::histogram!(labels::ACQUIRE_DURATION, "handle" => handle.to_string())
            .record(duration_ms as f64);
    }

    /// Time spent inside a scope, by outcome
    pub fn scope_duration(handle: &str, outcome: &'static str, duration_ms: u64) {
        metrics::histogram!(
            labels::SCOPE_DURATION,
            "handle" => handle.to_string(),
            "outcome" => outcome
        )
        .record(duration_ms as f64);
    }

    /// Time to authenticate
    pub fn auth_duration(mechanism: &'static str, duration_ms: u64) {
        metrics::histogram!(labels::AUTH_DURATION, "mechanism" => mechanism)
            .record(duration_ms as f64);
    }
}
