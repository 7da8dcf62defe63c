//! Caller-facing commands and the fire-and-forget dispatch handle.
//!
//! Every operation enqueues work and returns immediately; results arrive
//! later through the handlers the caller supplied. Handlers close over
//! whatever the application uses to receive messages, typically a channel
//! sender, which is how completions are routed back to the caller's own
//! message type.

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ConnectParams;
use crate::event::Inbound;
use crate::registry::{
    AffectedHandler, ConnectedHandler, ConnectionId, ConnectionLostHandler, DisconnectedHandler,
    ErrorHandler, RowsHandler,
};
use crate::subscription::ListenRequest;

/// One caller command, validated and issued by the dispatcher.
pub enum Command {
    /// Open a new connection.
    Connect {
        /// Connection parameters handed to the driver.
        params: ConnectParams,
        /// Error handler for connect failure.
        on_error: ErrorHandler,
        /// Success handler, delivering the allocated connection id.
        on_connected: ConnectedHandler,
        /// Handler for later driver-initiated connection loss.
        on_lost: ConnectionLostHandler,
    },
    /// Close a connection.
    Disconnect {
        /// The connection to close.
        id: ConnectionId,
        /// True closes and drops permanently; false releases to the
        /// driver's pool.
        discard: bool,
        /// Error handler for invalid id or disconnect failure.
        on_error: ErrorHandler,
        /// Success handler.
        on_disconnected: DisconnectedHandler,
    },
    /// Start a query with paginated results.
    Query {
        /// The connection to query on.
        id: ConnectionId,
        /// Statement text.
        sql: String,
        /// Maximum rows per batch; continuations repeat it.
        batch_size: u32,
        /// Error handler for invalid id or statement failure.
        on_error: ErrorHandler,
        /// Handler receiving each batch of rows.
        on_rows: RowsHandler,
    },
    /// Fetch the next batch of a previously started query.
    MoreQueryResults {
        /// The connection whose query to continue.
        id: ConnectionId,
        /// Error handler for invalid id or fetch failure.
        on_error: ErrorHandler,
        /// Handler receiving the batch; an empty batch ends the iteration.
        on_rows: RowsHandler,
    },
    /// Execute a statement, returning an affected-row count.
    ExecuteSql {
        /// The connection to execute on.
        id: ConnectionId,
        /// Statement text.
        sql: String,
        /// Error handler for invalid id or statement failure.
        on_error: ErrorHandler,
        /// Handler receiving the affected-row count.
        on_affected: AffectedHandler,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { params, .. } => {
                f.debug_struct("Connect").field("params", params).finish()
            }
            Self::Disconnect { id, discard, .. } => f
                .debug_struct("Disconnect")
                .field("id", id)
                .field("discard", discard)
                .finish(),
            Self::Query {
                id,
                sql,
                batch_size,
                ..
            } => f
                .debug_struct("Query")
                .field("id", id)
                .field("sql", sql)
                .field("batch_size", batch_size)
                .finish(),
            Self::MoreQueryResults { id, .. } => f
                .debug_struct("MoreQueryResults")
                .field("id", id)
                .finish(),
            Self::ExecuteSql { id, sql, .. } => f
                .debug_struct("ExecuteSql")
                .field("id", id)
                .field("sql", sql)
                .finish(),
        }
    }
}

/// Cloneable fire-and-forget handle onto a running dispatcher.
///
/// All methods return immediately; once the dispatcher has stopped,
/// submissions are dropped with a debug log.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl DispatcherHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { tx }
    }

    fn send(&self, inbound: Inbound) {
        if let Err(dropped) = self.tx.send(inbound) {
            debug!("dispatcher stopped; dropping {:?}", dropped.0);
        }
    }

    /// Submits an ordered batch of commands.
    pub fn submit(&self, commands: Vec<Command>) {
        self.send(Inbound::Commands(commands));
    }

    /// Opens a new connection; the allocated id arrives via `on_connected`.
    pub fn connect(
        &self,
        on_error: ErrorHandler,
        on_connected: ConnectedHandler,
        on_lost: ConnectionLostHandler,
        params: ConnectParams,
    ) {
        self.submit(vec![Command::Connect {
            params,
            on_error,
            on_connected,
            on_lost,
        }]);
    }

    /// Closes a connection.
    pub fn disconnect(
        &self,
        on_error: ErrorHandler,
        on_disconnected: DisconnectedHandler,
        id: ConnectionId,
        discard: bool,
    ) {
        self.submit(vec![Command::Disconnect {
            id,
            discard,
            on_error,
            on_disconnected,
        }]);
    }

    /// Starts a query, requesting up to `batch_size` rows per batch.
    pub fn query(
        &self,
        on_error: ErrorHandler,
        on_rows: RowsHandler,
        id: ConnectionId,
        sql: impl Into<String>,
        batch_size: u32,
    ) {
        self.submit(vec![Command::Query {
            id,
            sql: sql.into(),
            batch_size,
            on_error,
            on_rows,
        }]);
    }

    /// Fetches the next batch of an in-progress query.
    pub fn more_query_results(
        &self,
        on_error: ErrorHandler,
        on_rows: RowsHandler,
        id: ConnectionId,
    ) {
        self.submit(vec![Command::MoreQueryResults {
            id,
            on_error,
            on_rows,
        }]);
    }

    /// Executes a statement.
    pub fn execute_sql(
        &self,
        on_error: ErrorHandler,
        on_affected: AffectedHandler,
        id: ConnectionId,
        sql: impl Into<String>,
    ) {
        self.submit(vec![Command::ExecuteSql {
            id,
            sql: sql.into(),
            on_error,
            on_affected,
        }]);
    }

    /// Declares the full desired subscription set for the next
    /// reconciliation cycle.
    pub fn set_listeners(&self, requests: Vec<ListenRequest>) {
        self.send(Inbound::Listeners(requests));
    }

    /// Stops the dispatcher loop after it drains messages already enqueued.
    pub fn shutdown(&self) {
        self.send(Inbound::Shutdown);
    }
}
