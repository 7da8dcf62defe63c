//! Dispatcher event types.
//!
//! [`ListenEvent`] is the public tag delivered to subscription lifecycle
//! handlers. [`Completion`] and [`Inbound`] are internal: completions are the
//! one-per-operation resolutions posted by driver tasks, and `Inbound` is the
//! single message type the dispatcher loop consumes.

use std::fmt;

use crate::command::Command;
use crate::driver::{ClientHandle, CursorHandle, ListenHandle, Row};
use crate::registry::ConnectionId;
use crate::subscription::ListenRequest;

/// A subscription lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenEvent {
    /// The channel subscription became active.
    Listen,
    /// The channel subscription was stopped.
    Unlisten,
}

impl fmt::Display for ListenEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen => write!(f, "listen"),
            Self::Unlisten => write!(f, "unlisten"),
        }
    }
}

/// Resolution of one issued native operation.
///
/// Exactly one of these is posted back onto the dispatcher inbox per native
/// call, plus driver-initiated `ConnectionLost` and `Notification` events.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Connect succeeded; the record gains its client and listen handles.
    ConnectOk {
        id: ConnectionId,
        client: ClientHandle,
        listen: ListenHandle,
    },
    /// Connect failed; the half-created record is removed.
    ConnectFailed { id: ConnectionId, message: String },
    /// The driver reported an established connection as lost.
    ConnectionLost { id: ConnectionId, message: String },
    /// Disconnect succeeded; the record is removed.
    DisconnectOk { id: ConnectionId },
    /// Disconnect failed; the record stays.
    DisconnectFailed { id: ConnectionId, message: String },
    /// Query succeeded with the first batch and a cursor for continuation.
    QueryOk {
        id: ConnectionId,
        cursor: CursorHandle,
        rows: Vec<Row>,
    },
    /// A continuation fetch succeeded; empty rows mean the set is drained.
    MoreRows { id: ConnectionId, rows: Vec<Row> },
    /// A SQL-bearing operation (query, execute, listen, unlisten) failed.
    SqlFailed {
        id: ConnectionId,
        sql: String,
        message: String,
    },
    /// Execute succeeded with an affected-row count.
    ExecuteOk { id: ConnectionId, affected: u64 },
    /// LISTEN succeeded; the connection gains a new listen handle.
    ListenOk {
        id: ConnectionId,
        channel: String,
        listen: ListenHandle,
    },
    /// UNLISTEN succeeded.
    UnlistenOk { id: ConnectionId, channel: String },
    /// A payload was published on a subscribed channel.
    Notification {
        id: ConnectionId,
        channel: String,
        payload: String,
    },
}

/// Everything the dispatcher loop consumes, serialized onto one channel.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// An ordered batch of caller commands.
    Commands(Vec<Command>),
    /// The full desired-subscription snapshot for a reconciliation cycle.
    Listeners(Vec<ListenRequest>),
    /// A native operation resolved, or a driver-initiated event arrived.
    Completion(Completion),
    /// Stop the dispatcher loop.
    Shutdown,
}
