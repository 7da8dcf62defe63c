//! Connection registry and per-connection state.
//!
//! The registry owns identifier allocation and the mapping from
//! [`ConnectionId`] to [`Connection`]. It is created empty at dispatcher
//! startup and mutated exclusively by the dispatcher's single control task;
//! nothing here needs a lock.
//!
//! A [`Connection`] record remembers, besides the opaque native handles, the
//! handler callbacks that interpret the next completion for each operation
//! kind. Commands record their handlers before the native call is issued; the
//! completion router later requires them to be present.

use std::collections::HashMap;
use std::fmt;

use crate::driver::{ClientHandle, CursorHandle, ListenHandle, Row};
use crate::event::ListenEvent;

/// Opaque identifier for one logical database connection.
///
/// Monotonically allocated by the registry; never reused while the
/// connection is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handler for per-operation errors: `(connection id, message)`.
pub type ErrorHandler = Box<dyn Fn(ConnectionId, String) + Send>;

/// Handler for connect success.
pub type ConnectedHandler = Box<dyn Fn(ConnectionId) + Send>;

/// Handler for driver-initiated connection loss: `(connection id, message)`.
pub type ConnectionLostHandler = Box<dyn Fn(ConnectionId, String) + Send>;

/// Handler for disconnect success.
pub type DisconnectedHandler = Box<dyn Fn(ConnectionId) + Send>;

/// Handler for query result batches. An empty batch signals the end of the
/// result set.
pub type RowsHandler = Box<dyn Fn(ConnectionId, Vec<Row>) + Send>;

/// Handler for execute success: `(connection id, affected rows)`.
pub type AffectedHandler = Box<dyn Fn(ConnectionId, u64) + Send>;

/// Handler for subscription lifecycle transitions:
/// `(connection id, channel, event)`.
pub type LifecycleHandler = Box<dyn Fn(ConnectionId, String, ListenEvent) + Send>;

/// Handler for published notifications: `(connection id, channel, payload)`.
pub type NotificationHandler = Box<dyn Fn(ConnectionId, String, String) + Send>;

/// State of one registered connection.
pub struct Connection {
    /// Error handler for the most recently issued operation.
    pub on_error: ErrorHandler,
    /// Connect success handler; consumed when connect completes.
    pub on_connected: Option<ConnectedHandler>,
    /// Driver-initiated connection-loss handler.
    pub on_lost: ConnectionLostHandler,
    /// Disconnect success handler; set by the disconnect command.
    pub on_disconnected: Option<DisconnectedHandler>,
    /// Query result handler; set by query commands, shared by continuations.
    pub on_rows: Option<RowsHandler>,
    /// Execute result handler; set by execute commands.
    pub on_affected: Option<AffectedHandler>,
    /// Lifecycle handler for listen/unlisten transitions.
    pub on_lifecycle: Option<LifecycleHandler>,
    /// Notification handler for published payloads.
    pub on_notification: Option<NotificationHandler>,

    /// Native client handle; present iff connect has completed and
    /// disconnect has not.
    pub client: Option<ClientHandle>,
    /// Native cursor handle; present while a result set is being paginated.
    pub cursor: Option<CursorHandle>,
    /// Native listen-channel handle; from connect, replaced on LISTEN.
    pub listen: Option<ListenHandle>,

    /// Most recently issued SQL text, kept for error context and query
    /// continuation.
    pub last_sql: Option<String>,
    /// Batch size of the in-progress query, repeated by continuations.
    pub batch_size: Option<u32>,
}

impl Connection {
    /// Creates a fresh record with the handlers a connect command supplies
    /// and every handle absent.
    #[must_use]
    pub fn new(
        on_error: ErrorHandler,
        on_connected: ConnectedHandler,
        on_lost: ConnectionLostHandler,
    ) -> Self {
        Self {
            on_error,
            on_connected: Some(on_connected),
            on_lost,
            on_disconnected: None,
            on_rows: None,
            on_affected: None,
            on_lifecycle: None,
            on_notification: None,
            client: None,
            cursor: None,
            listen: None,
            last_sql: None,
            batch_size: None,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client", &self.client)
            .field("cursor", &self.cursor)
            .field("listen", &self.listen)
            .field("last_sql", &self.last_sql)
            .field("batch_size", &self.batch_size)
            .field("has_connected_handler", &self.on_connected.is_some())
            .field("has_disconnect_handler", &self.on_disconnected.is_some())
            .field("has_rows_handler", &self.on_rows.is_some())
            .field("has_affected_handler", &self.on_affected.is_some())
            .field("has_lifecycle_handler", &self.on_lifecycle.is_some())
            .field("has_notification_handler", &self.on_notification.is_some())
            .finish()
    }
}

/// In-memory dispatcher state: identifier allocation, the connection map,
/// and the set of active listen channels.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: u64,
    connections: HashMap<ConnectionId, Connection>,
    active_listens: HashMap<ConnectionId, String>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh identifier and registers the connection under it.
    pub fn allocate(&mut self, connection: Connection) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(id, connection);
        id
    }

    /// Returns the connection for `id`, if registered.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Returns the connection for `id` mutably, if registered.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Removes and returns the connection for `id`, along with any active
    /// listen entry.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.active_listens.remove(&id);
        self.connections.remove(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The channel `id` is currently subscribed to, if any.
    #[must_use]
    pub fn active_channel(&self, id: ConnectionId) -> Option<&str> {
        self.active_listens.get(&id).map(String::as_str)
    }

    /// All active `(connection, channel)` subscription entries.
    #[must_use]
    pub fn active_listens(&self) -> &HashMap<ConnectionId, String> {
        &self.active_listens
    }

    /// Marks `channel` as the active subscription for `id`.
    pub fn set_active_listen(&mut self, id: ConnectionId, channel: String) {
        self.active_listens.insert(id, channel);
    }

    /// Clears the active subscription for `id`.
    pub fn clear_active_listen(&mut self, id: ConnectionId) {
        self.active_listens.remove(&id);
    }

    /// Renders the full registry for fatal diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> String {
        let mut entries: Vec<_> = self.connections.iter().collect();
        entries.sort_by_key(|(id, _)| id.0);
        let mut out = String::from("{");
        for (id, conn) in entries {
            let channel = self.active_listens.get(id).map(String::as_str);
            out.push_str(&format!(" {id}: {conn:?} (listening: {channel:?})"));
        }
        out.push_str(" }");
        out
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("active_listens", &self.active_listens.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
