//! Test support: an in-memory [`PgDriver`] with scripted behavior.
//!
//! [`MockDriver`] records every native call it receives, serves row fixtures
//! through a real paginating cursor, and exposes the [`LostSignal`]s and
//! [`NotificationSink`]s it was handed so tests can fake driver-initiated
//! events. Failure injection is per concern: connect, SQL-bearing
//! operations, or an indefinite connect hang for timeout tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ConnectParams;
use crate::driver::{
    ClientHandle, CursorHandle, ListenHandle, LostSignal, NotificationSink, PgDriver, Row,
};
use crate::error::DriverError;

/// One recorded native call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    /// `connect` was issued for the named database.
    Connect {
        /// Database named in the connect parameters.
        database: String,
    },
    /// `disconnect` was issued.
    Disconnect {
        /// Client handle the call targeted.
        client: ClientHandle,
        /// Whether the connection was discarded or released.
        discard: bool,
    },
    /// `query` was issued.
    Query {
        /// Client handle the call targeted.
        client: ClientHandle,
        /// Statement text.
        sql: String,
        /// Requested batch size.
        batch_size: u32,
    },
    /// `more_query_results` was issued.
    MoreQueryResults {
        /// Client handle the call targeted.
        client: ClientHandle,
        /// Cursor being continued.
        cursor: CursorHandle,
        /// Requested batch size.
        batch_size: u32,
    },
    /// `execute_sql` was issued.
    ExecuteSql {
        /// Client handle the call targeted.
        client: ClientHandle,
        /// Statement text.
        sql: String,
    },
    /// `listen` was issued.
    Listen {
        /// Client handle the call targeted.
        client: ClientHandle,
        /// The LISTEN statement text.
        sql: String,
    },
    /// `unlisten` was issued.
    Unlisten {
        /// Client handle the call targeted.
        client: ClientHandle,
        /// The UNLISTEN statement text.
        sql: String,
    },
}

/// In-memory driver with scripted results and a full call log.
#[derive(Default)]
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    rows: Mutex<Vec<Row>>,
    affected: AtomicU64,
    next_handle: AtomicU64,
    cursors: Mutex<HashMap<CursorHandle, usize>>,
    connect_failure: Mutex<Option<String>>,
    sql_failure: Mutex<Option<String>>,
    disconnect_failure: AtomicBool,
    hang_connect: AtomicBool,
    lost_signals: Mutex<Vec<LostSignal>>,
    notification_sinks: Mutex<Vec<NotificationSink>>,
}

impl MockDriver {
    /// Creates a driver that succeeds on everything and returns no rows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the full result set served by subsequent queries, one batch at a
    /// time.
    #[must_use]
    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        *self.rows.lock() = rows;
        self
    }

    /// Sets the affected-row count returned by `execute_sql`.
    #[must_use]
    pub fn with_affected(self, affected: u64) -> Self {
        self.affected.store(affected, Ordering::Relaxed);
        self
    }

    /// Makes subsequent `connect` calls fail with the given message.
    pub fn fail_connect(&self, message: impl Into<String>) {
        *self.connect_failure.lock() = Some(message.into());
    }

    /// Makes subsequent SQL-bearing calls fail with the given message.
    pub fn fail_sql(&self, message: impl Into<String>) {
        *self.sql_failure.lock() = Some(message.into());
    }

    /// Clears SQL failure injection.
    pub fn clear_sql_failure(&self) {
        *self.sql_failure.lock() = None;
    }

    /// Makes subsequent `disconnect` calls fail as if the underlying
    /// connection had already gone away.
    pub fn fail_disconnect(&self) {
        self.disconnect_failure.store(true, Ordering::Relaxed);
    }

    /// Clears disconnect failure injection.
    pub fn clear_disconnect_failure(&self) {
        self.disconnect_failure.store(false, Ordering::Relaxed);
    }

    /// Makes subsequent `connect` calls never resolve.
    pub fn hang_connect(&self) {
        self.hang_connect.store(true, Ordering::Relaxed);
    }

    /// All native calls recorded so far, in issue order.
    #[must_use]
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    /// The loss signals handed over by `connect`, in connect order.
    #[must_use]
    pub fn lost_signals(&self) -> Vec<LostSignal> {
        self.lost_signals.lock().clone()
    }

    /// The notification sinks handed over by `listen`, in listen order.
    #[must_use]
    pub fn notification_sinks(&self) -> Vec<NotificationSink> {
        self.notification_sinks.lock().clone()
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }

    fn fresh_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sql_failure(&self) -> Option<DriverError> {
        self.sql_failure.lock().clone().map(DriverError::Sql)
    }

    fn batch(&self, offset: usize, batch_size: u32) -> Vec<Row> {
        let rows = self.rows.lock();
        rows.iter()
            .skip(offset)
            .take(batch_size as usize)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("calls", &self.calls.lock().len())
            .field("rows", &self.rows.lock().len())
            .finish()
    }
}

#[async_trait]
impl PgDriver for MockDriver {
    async fn connect(
        &self,
        params: &ConnectParams,
        _timeout: Duration,
        lost: LostSignal,
    ) -> Result<(ClientHandle, ListenHandle), DriverError> {
        if self.hang_connect.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        self.record(DriverCall::Connect {
            database: params.database.clone(),
        });
        if let Some(message) = self.connect_failure.lock().clone() {
            return Err(DriverError::Connect(message));
        }
        self.lost_signals.lock().push(lost);
        Ok((
            ClientHandle(self.fresh_handle()),
            ListenHandle(self.fresh_handle()),
        ))
    }

    async fn disconnect(
        &self,
        client: ClientHandle,
        discard: bool,
        _listen: ListenHandle,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::Disconnect { client, discard });
        if self.disconnect_failure.load(Ordering::Relaxed) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    async fn query(
        &self,
        client: ClientHandle,
        sql: &str,
        batch_size: u32,
        _listen: ListenHandle,
    ) -> Result<(CursorHandle, Vec<Row>), DriverError> {
        self.record(DriverCall::Query {
            client,
            sql: sql.to_string(),
            batch_size,
        });
        if let Some(e) = self.sql_failure() {
            return Err(e);
        }
        let cursor = CursorHandle(self.fresh_handle());
        let batch = self.batch(0, batch_size);
        self.cursors.lock().insert(cursor, batch.len());
        Ok((cursor, batch))
    }

    async fn more_query_results(
        &self,
        client: ClientHandle,
        cursor: CursorHandle,
        batch_size: u32,
    ) -> Result<Vec<Row>, DriverError> {
        self.record(DriverCall::MoreQueryResults {
            client,
            cursor,
            batch_size,
        });
        if let Some(e) = self.sql_failure() {
            return Err(e);
        }
        let offset = self.cursors.lock().get(&cursor).copied().unwrap_or(0);
        let batch = self.batch(offset, batch_size);
        self.cursors.lock().insert(cursor, offset + batch.len());
        Ok(batch)
    }

    async fn execute_sql(&self, client: ClientHandle, sql: &str) -> Result<u64, DriverError> {
        self.record(DriverCall::ExecuteSql {
            client,
            sql: sql.to_string(),
        });
        if let Some(e) = self.sql_failure() {
            return Err(e);
        }
        Ok(self.affected.load(Ordering::Relaxed))
    }

    async fn listen(
        &self,
        client: ClientHandle,
        sql: &str,
        notifications: NotificationSink,
    ) -> Result<ListenHandle, DriverError> {
        self.record(DriverCall::Listen {
            client,
            sql: sql.to_string(),
        });
        if let Some(e) = self.sql_failure() {
            return Err(e);
        }
        self.notification_sinks.lock().push(notifications);
        Ok(ListenHandle(self.fresh_handle()))
    }

    async fn unlisten(
        &self,
        client: ClientHandle,
        sql: &str,
        _listen: ListenHandle,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::Unlisten {
            client,
            sql: sql.to_string(),
        });
        if let Some(e) = self.sql_failure() {
            return Err(e);
        }
        Ok(())
    }
}
