//! Dispatcher error types.
//!
//! Two distinct failure worlds, kept deliberately apart:
//! - [`DriverError`]: failures reported by the native driver adapter. These
//!   are recovered locally and delivered to the caller's error handler as a
//!   message string.
//! - [`InvariantViolation`]: broken bookkeeping inside the dispatcher itself
//!   (a completion arrived for a handler the dispatcher never recorded).
//!   Fatal; the run loop stops and surfaces it.

use thiserror::Error;

use crate::registry::ConnectionId;

/// Error message delivered when a command references a connection id that is
/// not present in the registry.
pub const INVALID_CONNECTION_ID: &str = "Invalid connectionId";

/// Errors reported by a [`PgDriver`](crate::driver::PgDriver) implementation.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Connection establishment failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A SQL-bearing operation (query, execute, listen, unlisten) failed.
    #[error("{0}")]
    Sql(String),

    /// The operation did not complete within the allowed time.
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// The underlying connection has been closed.
    #[error("connection closed")]
    Closed,
}

/// A broken internal invariant: the dispatcher received a completion it did
/// not set itself up to interpret.
///
/// This is a defect in the dispatcher's own bookkeeping, never a recoverable
/// runtime condition. It carries full diagnostic context: the connection id,
/// what was missing, and a snapshot of the registry at the moment of failure.
#[derive(Debug, Error)]
#[error("dispatcher invariant violated for {connection_id}: {detail}\nregistry: {registry}")]
pub struct InvariantViolation {
    /// The connection the offending completion referenced.
    pub connection_id: ConnectionId,
    /// What the dispatcher expected to find and did not.
    pub detail: String,
    /// Debug rendering of the registry at the time of the violation.
    pub registry: String,
}

impl InvariantViolation {
    /// Creates a violation for the given connection with a registry snapshot.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        detail: impl Into<String>,
        registry: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            detail: detail.into(),
            registry: registry.into(),
        }
    }
}
