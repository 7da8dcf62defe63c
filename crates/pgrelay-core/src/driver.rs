//! The native driver adapter seam.
//!
//! Defines the [`PgDriver`] async trait the dispatcher consumes, and the
//! opaque resource handles threaded through it. The dispatcher never inspects
//! a handle's contents; it only stores them in the registry entry they belong
//! to and passes them back on later calls. Driver-initiated events (loss of
//! a connection, NOTIFY payloads) are delivered through [`LostSignal`] and
//! [`NotificationSink`], which route onto the dispatcher's serialized inbox.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ConnectParams;
use crate::error::DriverError;
use crate::event::{Completion, Inbound};
use crate::registry::ConnectionId;

/// A single result row, opaque to the dispatcher.
///
/// Rows are produced and interpreted by the driver adapter and the
/// application; the dispatcher only moves them.
pub type Row = serde_json::Value;

/// Opaque handle to a live native client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u64);

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Opaque handle to a native result cursor for an in-progress query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle(pub u64);

impl fmt::Display for CursorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor-{}", self.0)
    }
}

/// Opaque handle to a native listen channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(pub u64);

impl fmt::Display for ListenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listen-{}", self.0)
    }
}

/// Signal through which a driver reports that an established connection was
/// lost outside any in-flight operation.
///
/// Handed to the driver at connect time. Firing it more than once, or after
/// the connection was disconnected, is harmless: the stale event is dropped
/// by the dispatcher.
#[derive(Debug, Clone)]
pub struct LostSignal {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl LostSignal {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { id, tx }
    }

    /// Reports the connection as lost.
    pub fn fire(&self, message: impl Into<String>) {
        let _ = self.tx.send(Inbound::Completion(Completion::ConnectionLost {
            id: self.id,
            message: message.into(),
        }));
    }
}

/// Sink through which a driver delivers NOTIFY payloads for an active listen
/// channel.
///
/// Handed to the driver on each `listen` call.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl NotificationSink {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { id, tx }
    }

    /// Delivers one published notification.
    pub fn publish(&self, channel: impl Into<String>, payload: impl Into<String>) {
        let _ = self.tx.send(Inbound::Completion(Completion::Notification {
            id: self.id,
            channel: channel.into(),
            payload: payload.into(),
        }));
    }
}

/// The native driver operations the dispatcher issues.
///
/// Every method must resolve exactly once, with `Ok` or `Err`; the dispatcher
/// turns each resolution into exactly one completion event on its inbox.
/// Implementations own the real wire protocol, TLS, and any pooling; the
/// dispatcher treats the returned handles as opaque.
#[async_trait]
pub trait PgDriver: Send + Sync {
    /// Establishes a connection and a dedicated listen channel for it.
    ///
    /// `lost` must be fired if the established connection later drops outside
    /// any in-flight operation.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Connect`] if the connection cannot be
    /// established within `timeout`.
    async fn connect(
        &self,
        params: &ConnectParams,
        timeout: Duration,
        lost: LostSignal,
    ) -> Result<(ClientHandle, ListenHandle), DriverError>;

    /// Closes a connection.
    ///
    /// `discard` true closes and drops the native connection permanently;
    /// false releases it back to whatever pool the driver maintains.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] if the close fails.
    async fn disconnect(
        &self,
        client: ClientHandle,
        discard: bool,
        listen: ListenHandle,
    ) -> Result<(), DriverError>;

    /// Starts a query, returning a cursor and the first batch of up to
    /// `batch_size` rows.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Sql`] if the statement fails.
    async fn query(
        &self,
        client: ClientHandle,
        sql: &str,
        batch_size: u32,
        listen: ListenHandle,
    ) -> Result<(CursorHandle, Vec<Row>), DriverError>;

    /// Fetches the next batch of up to `batch_size` rows from an open cursor.
    ///
    /// An empty result signals that the result set is drained.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Sql`] if the fetch fails.
    async fn more_query_results(
        &self,
        client: ClientHandle,
        cursor: CursorHandle,
        batch_size: u32,
    ) -> Result<Vec<Row>, DriverError>;

    /// Executes a statement, returning the affected-row count.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Sql`] if the statement fails.
    async fn execute_sql(&self, client: ClientHandle, sql: &str) -> Result<u64, DriverError>;

    /// Issues the given LISTEN statement, returning the new listen-channel
    /// handle. Published payloads must flow through `notifications`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Sql`] if the statement fails.
    async fn listen(
        &self,
        client: ClientHandle,
        sql: &str,
        notifications: NotificationSink,
    ) -> Result<ListenHandle, DriverError>;

    /// Issues the given UNLISTEN statement against an active listen channel.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Sql`] if the statement fails.
    async fn unlisten(
        &self,
        client: ClientHandle,
        sql: &str,
        listen: ListenHandle,
    ) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(ClientHandle(3).to_string(), "client-3");
        assert_eq!(CursorHandle(9).to_string(), "cursor-9");
        assert_eq!(ListenHandle(1).to_string(), "listen-1");
    }

    #[tokio::test]
    async fn test_lost_signal_posts_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signal = LostSignal::new(ConnectionId(4), tx);
        signal.fire("socket closed");

        match rx.recv().await {
            Some(Inbound::Completion(Completion::ConnectionLost { id, message })) => {
                assert_eq!(id, ConnectionId(4));
                assert_eq!(message, "socket closed");
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notification_sink_posts_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = NotificationSink::new(ConnectionId(2), tx);
        sink.publish("jobs", "{\"id\":1}");

        match rx.recv().await {
            Some(Inbound::Completion(Completion::Notification {
                id,
                channel,
                payload,
            })) => {
                assert_eq!(id, ConnectionId(2));
                assert_eq!(channel, "jobs");
                assert_eq!(payload, "{\"id\":1}");
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }
}
