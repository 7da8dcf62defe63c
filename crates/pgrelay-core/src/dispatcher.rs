//! The dispatcher core: one task, one inbox, one registry.
//!
//! [`Dispatcher::run`] consumes a single serialized inbox carrying caller
//! command batches, desired-subscription snapshots, and native-operation
//! completions. Registry reads and mutations therefore never race. Native
//! calls are never awaited in the loop: each batch's calls run sequentially
//! in one spawned task, posting exactly one completion per call back onto
//! the inbox, and the registry lookup by connection id, not arrival order,
//! re-establishes which connection a completion belongs to.
//!
//! Recoverable conditions (unknown ids, driver failures) are delivered to
//! caller handlers. A completion that the dispatcher's own bookkeeping cannot
//! interpret terminates the loop with an [`InvariantViolation`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::command::{Command, DispatcherHandle};
use crate::config::{ConnectParams, DispatcherConfig};
use crate::driver::{
    ClientHandle, CursorHandle, ListenHandle, LostSignal, NotificationSink, PgDriver,
};
use crate::error::{DriverError, InvariantViolation, INVALID_CONNECTION_ID};
use crate::event::{Completion, Inbound, ListenEvent};
use crate::metrics::DispatcherMetrics;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, ErrorHandler};
use crate::subscription::{diff_listens, ListenRequest};

/// One native call prepared from a validated command.
///
/// All calls of a batch run sequentially in a single task, so the adapter
/// observes them in submission order regardless of runtime flavor.
#[derive(Debug)]
enum NativeOp {
    Connect {
        id: ConnectionId,
        params: ConnectParams,
        timeout: Duration,
    },
    Disconnect {
        id: ConnectionId,
        client: ClientHandle,
        discard: bool,
        listen: ListenHandle,
    },
    Query {
        id: ConnectionId,
        client: ClientHandle,
        sql: String,
        batch_size: u32,
        listen: ListenHandle,
    },
    MoreRows {
        id: ConnectionId,
        client: ClientHandle,
        cursor: CursorHandle,
        batch_size: u32,
        sql: String,
    },
    Execute {
        id: ConnectionId,
        client: ClientHandle,
        sql: String,
    },
}

/// One LISTEN or UNLISTEN operation queued by a reconciliation cycle.
///
/// All operations of a cycle run sequentially in a single task, so the
/// adapter observes every removal before any addition.
enum ListenOp {
    Unlisten {
        id: ConnectionId,
        channel: String,
        client: ClientHandle,
        listen: ListenHandle,
        sql: String,
    },
    Listen {
        id: ConnectionId,
        channel: String,
        client: ClientHandle,
        sql: String,
    },
}

/// The stateful command/subscription dispatcher.
///
/// Constructed with [`Dispatcher::new`], which also yields the cloneable
/// [`DispatcherHandle`] callers submit through; driven by [`Dispatcher::run`]
/// or [`Dispatcher::spawn`].
pub struct Dispatcher {
    driver: Arc<dyn PgDriver>,
    config: DispatcherConfig,
    registry: ConnectionRegistry,
    rx: mpsc::UnboundedReceiver<Inbound>,
    tx: mpsc::UnboundedSender<Inbound>,
    metrics: Arc<DispatcherMetrics>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given driver and the handle to submit
    /// work through.
    #[must_use]
    pub fn new(driver: Arc<dyn PgDriver>, config: DispatcherConfig) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle::new(tx.clone());
        let dispatcher = Self {
            driver,
            config,
            registry: ConnectionRegistry::new(),
            rx,
            tx,
            metrics: Arc::new(DispatcherMetrics::new()),
        };
        (dispatcher, handle)
    }

    /// Returns the dispatcher's metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Runs the dispatch loop until shutdown or a fatal invariant violation.
    ///
    /// # Errors
    ///
    /// Returns the [`InvariantViolation`] that terminated the loop. This is
    /// always a dispatcher bookkeeping defect, never a recoverable runtime
    /// condition.
    pub async fn run(mut self) -> Result<(), InvariantViolation> {
        while let Some(inbound) = self.rx.recv().await {
            match inbound {
                Inbound::Commands(commands) => {
                    let mut ops = Vec::with_capacity(commands.len());
                    for command in commands {
                        if let Some(op) = self.prepare_command(command)? {
                            ops.push(op);
                        }
                    }
                    self.issue(ops);
                }
                Inbound::Listeners(requests) => self.reconcile(requests),
                Inbound::Completion(completion) => self.route_completion(completion)?,
                Inbound::Shutdown => break,
            }
        }
        Ok(())
    }

    /// Spawns the dispatch loop onto the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<(), InvariantViolation>> {
        tokio::spawn(self.run())
    }

    // ── Command dispatch ──

    /// Validates one command against the registry, records its handlers, and
    /// prepares the native call to issue. `Ok(None)` means the command was
    /// rejected to its own error handler and nothing is issued.
    fn prepare_command(
        &mut self,
        command: Command,
    ) -> Result<Option<NativeOp>, InvariantViolation> {
        DispatcherMetrics::incr(&self.metrics.commands_total);
        match command {
            Command::Connect {
                params,
                on_error,
                on_connected,
                on_lost,
            } => {
                let id = self
                    .registry
                    .allocate(Connection::new(on_error, on_connected, on_lost));
                Ok(Some(NativeOp::Connect {
                    id,
                    params,
                    timeout: self.config.connect_timeout,
                }))
            }

            Command::Disconnect {
                id,
                discard,
                on_error,
                on_disconnected,
            } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                let (Some(client), Some(listen)) = (conn.client, conn.listen) else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                conn.on_error = on_error;
                conn.on_disconnected = Some(on_disconnected);
                Ok(Some(NativeOp::Disconnect {
                    id,
                    client,
                    discard,
                    listen,
                }))
            }

            Command::Query {
                id,
                sql,
                batch_size,
                on_error,
                on_rows,
            } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                let (Some(client), Some(listen)) = (conn.client, conn.listen) else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                conn.on_error = on_error;
                conn.on_rows = Some(on_rows);
                conn.last_sql = Some(sql.clone());
                conn.batch_size = Some(batch_size);
                Ok(Some(NativeOp::Query {
                    id,
                    client,
                    sql,
                    batch_size,
                    listen,
                }))
            }

            Command::MoreQueryResults {
                id,
                on_error,
                on_rows,
            } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                let Some(client) = conn.client else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                let state = (conn.cursor, conn.batch_size, conn.last_sql.clone());
                let (Some(cursor), Some(batch_size), Some(sql)) = state else {
                    return Err(self.violation(
                        id,
                        "query continuation with no query in progress \
                         (missing cursor, batch size, or statement text)",
                    ));
                };
                conn.on_error = on_error;
                conn.on_rows = Some(on_rows);
                Ok(Some(NativeOp::MoreRows {
                    id,
                    client,
                    cursor,
                    batch_size,
                    sql,
                }))
            }

            Command::ExecuteSql {
                id,
                sql,
                on_error,
                on_affected,
            } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                let Some(client) = conn.client else {
                    self.reject_invalid(id, &on_error);
                    return Ok(None);
                };
                conn.on_error = on_error;
                conn.on_affected = Some(on_affected);
                conn.last_sql = Some(sql.clone());
                Ok(Some(NativeOp::Execute { id, client, sql }))
            }
        }
    }

    /// Runs a batch's native calls sequentially in one spawned task, so they
    /// reach the adapter in submission order; each call posts exactly one
    /// completion back onto the inbox.
    fn issue(&self, ops: Vec<NativeOp>) {
        if ops.is_empty() {
            return;
        }
        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            for op in ops {
                let completion = Self::perform(driver.as_ref(), &tx, op).await;
                let _ = tx.send(Inbound::Completion(completion));
            }
        });
    }

    async fn perform(
        driver: &dyn PgDriver,
        tx: &mpsc::UnboundedSender<Inbound>,
        op: NativeOp,
    ) -> Completion {
        match op {
            NativeOp::Connect {
                id,
                params,
                timeout,
            } => {
                let lost = LostSignal::new(id, tx.clone());
                match tokio::time::timeout(timeout, driver.connect(&params, timeout, lost)).await {
                    Ok(Ok((client, listen))) => Completion::ConnectOk { id, client, listen },
                    Ok(Err(e)) => Completion::ConnectFailed {
                        id,
                        message: e.to_string(),
                    },
                    Err(_) => Completion::ConnectFailed {
                        id,
                        message: DriverError::Timeout(
                            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        )
                        .to_string(),
                    },
                }
            }

            NativeOp::Disconnect {
                id,
                client,
                discard,
                listen,
            } => match driver.disconnect(client, discard, listen).await {
                Ok(()) => Completion::DisconnectOk { id },
                Err(e) => Completion::DisconnectFailed {
                    id,
                    message: e.to_string(),
                },
            },

            NativeOp::Query {
                id,
                client,
                sql,
                batch_size,
                listen,
            } => match driver.query(client, &sql, batch_size, listen).await {
                Ok((cursor, rows)) => Completion::QueryOk { id, cursor, rows },
                Err(e) => Completion::SqlFailed {
                    id,
                    sql,
                    message: e.to_string(),
                },
            },

            NativeOp::MoreRows {
                id,
                client,
                cursor,
                batch_size,
                sql,
            } => match driver.more_query_results(client, cursor, batch_size).await {
                Ok(rows) => Completion::MoreRows { id, rows },
                Err(e) => Completion::SqlFailed {
                    id,
                    sql,
                    message: e.to_string(),
                },
            },

            NativeOp::Execute { id, client, sql } => match driver.execute_sql(client, &sql).await {
                Ok(affected) => Completion::ExecuteOk { id, affected },
                Err(e) => Completion::SqlFailed {
                    id,
                    sql,
                    message: e.to_string(),
                },
            },
        }
    }

    // ── Subscription reconciliation ──

    fn reconcile(&mut self, requests: Vec<ListenRequest>) {
        // Last declaration wins when a snapshot names a connection twice.
        let mut declared: HashMap<ConnectionId, ListenRequest> = HashMap::new();
        for request in requests {
            declared.insert(request.connection_id, request);
        }

        // Unknown ids are reported synchronously and skipped.
        let mut valid: HashMap<ConnectionId, ListenRequest> = HashMap::new();
        for (id, request) in declared {
            if self.registry.contains(id) {
                valid.insert(id, request);
            } else {
                self.reject_invalid(id, &request.on_error);
            }
        }

        let desired: HashMap<ConnectionId, String> = valid
            .iter()
            .map(|(&id, request)| (id, request.channel.clone()))
            .collect();
        let delta = diff_listens(self.registry.active_listens(), &desired);

        let mut ops: Vec<ListenOp> = Vec::new();

        // Stop old channels before starting new ones.
        for (id, channel) in delta.removed {
            let sql = format!("UNLISTEN \"{channel}\"");
            let handles = match self.registry.get_mut(id) {
                Some(conn) => match (conn.client, conn.listen) {
                    (Some(client), Some(listen)) => {
                        conn.last_sql = Some(sql.clone());
                        Some((client, listen))
                    }
                    _ => None,
                },
                None => None,
            };
            self.registry.clear_active_listen(id);
            if let Some((client, listen)) = handles {
                DispatcherMetrics::incr(&self.metrics.unlistens_issued);
                ops.push(ListenOp::Unlisten {
                    id,
                    channel,
                    client,
                    listen,
                    sql,
                });
            } else {
                warn!(%id, channel, "no native listen handle to stop; dropping subscription");
            }
        }

        for (id, channel) in delta.added {
            let Some(request) = valid.remove(&id) else {
                continue;
            };
            let sql = format!("LISTEN \"{channel}\"");
            let client = match self.registry.get_mut(id) {
                Some(conn) => match conn.client {
                    Some(client) => {
                        conn.on_error = request.on_error;
                        conn.on_lifecycle = Some(request.on_lifecycle);
                        conn.on_notification = Some(request.on_notification);
                        conn.last_sql = Some(sql.clone());
                        Some(client)
                    }
                    None => {
                        self.reject_invalid(id, &request.on_error);
                        None
                    }
                },
                None => None,
            };
            if let Some(client) = client {
                self.registry.set_active_listen(id, channel.clone());
                DispatcherMetrics::incr(&self.metrics.listens_issued);
                ops.push(ListenOp::Listen {
                    id,
                    channel,
                    client,
                    sql,
                });
            }
        }

        if ops.is_empty() {
            return;
        }

        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            for op in ops {
                let completion = match op {
                    ListenOp::Unlisten {
                        id,
                        channel,
                        client,
                        listen,
                        sql,
                    } => match driver.unlisten(client, &sql, listen).await {
                        Ok(()) => Completion::UnlistenOk { id, channel },
                        Err(e) => Completion::SqlFailed {
                            id,
                            sql,
                            message: e.to_string(),
                        },
                    },
                    ListenOp::Listen {
                        id,
                        channel,
                        client,
                        sql,
                    } => {
                        let sink = NotificationSink::new(id, tx.clone());
                        match driver.listen(client, &sql, sink).await {
                            Ok(listen) => Completion::ListenOk {
                                id,
                                channel,
                                listen,
                            },
                            Err(e) => Completion::SqlFailed {
                                id,
                                sql,
                                message: e.to_string(),
                            },
                        }
                    }
                };
                let _ = tx.send(Inbound::Completion(completion));
            }
        });
    }

    // ── Completion routing ──

    #[allow(clippy::too_many_lines)]
    fn route_completion(&mut self, completion: Completion) -> Result<(), InvariantViolation> {
        DispatcherMetrics::incr(&self.metrics.completions_total);
        match completion {
            Completion::ConnectOk { id, client, listen } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    self.drop_stale(id, "connect success");
                    return Ok(());
                };
                conn.client = Some(client);
                conn.listen = Some(listen);
                let Some(on_connected) = conn.on_connected.take() else {
                    return Err(self.violation(id, "connect completion with no connect handler"));
                };
                on_connected(id);
                Ok(())
            }

            Completion::ConnectFailed { id, message } => {
                let Some(conn) = self.registry.remove(id) else {
                    self.drop_stale(id, "connect failure");
                    return Ok(());
                };
                DispatcherMetrics::incr(&self.metrics.driver_errors);
                (conn.on_error)(id, message);
                Ok(())
            }

            Completion::ConnectionLost { id, message } => {
                let Some(conn) = self.registry.remove(id) else {
                    self.drop_stale(id, "connection loss");
                    return Ok(());
                };
                DispatcherMetrics::incr(&self.metrics.connections_lost);
                (conn.on_lost)(id, message);
                Ok(())
            }

            Completion::DisconnectOk { id } => {
                let Some(conn) = self.registry.remove(id) else {
                    self.drop_stale(id, "disconnect success");
                    return Ok(());
                };
                let Some(on_disconnected) = conn.on_disconnected else {
                    return Err(
                        self.violation(id, "disconnect completion with no disconnect handler")
                    );
                };
                on_disconnected(id);
                Ok(())
            }

            Completion::DisconnectFailed { id, message } => {
                let Some(conn) = self.registry.get(id) else {
                    self.drop_stale(id, "disconnect failure");
                    return Ok(());
                };
                DispatcherMetrics::incr(&self.metrics.driver_errors);
                (conn.on_error)(id, message);
                Ok(())
            }

            Completion::QueryOk { id, cursor, rows } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    self.drop_stale(id, "query success");
                    return Ok(());
                };
                conn.cursor = Some(cursor);
                let Some(on_rows) = conn.on_rows.as_ref() else {
                    return Err(self.violation(id, "query completion with no query handler"));
                };
                on_rows(id, rows);
                Ok(())
            }

            Completion::MoreRows { id, rows } => {
                let Some(conn) = self.registry.get(id) else {
                    self.drop_stale(id, "query continuation");
                    return Ok(());
                };
                let Some(on_rows) = conn.on_rows.as_ref() else {
                    return Err(self.violation(id, "continuation completion with no query handler"));
                };
                on_rows(id, rows);
                Ok(())
            }

            Completion::SqlFailed { id, sql, message } => {
                let Some(conn) = self.registry.get(id) else {
                    self.drop_stale(id, "statement failure");
                    return Ok(());
                };
                DispatcherMetrics::incr(&self.metrics.driver_errors);
                (conn.on_error)(id, format!("{message}; sql: {sql}"));
                Ok(())
            }

            Completion::ExecuteOk { id, affected } => {
                let Some(conn) = self.registry.get(id) else {
                    self.drop_stale(id, "execute success");
                    return Ok(());
                };
                let Some(on_affected) = conn.on_affected.as_ref() else {
                    return Err(self.violation(id, "execute completion with no execute handler"));
                };
                on_affected(id, affected);
                Ok(())
            }

            Completion::ListenOk {
                id,
                channel,
                listen,
            } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    self.drop_stale(id, "listen success");
                    return Ok(());
                };
                conn.listen = Some(listen);
                let Some(on_lifecycle) = conn.on_lifecycle.as_ref() else {
                    return Err(self.violation(id, "listen completion with no lifecycle handler"));
                };
                on_lifecycle(id, channel, ListenEvent::Listen);
                Ok(())
            }

            Completion::UnlistenOk { id, channel } => {
                let Some(conn) = self.registry.get(id) else {
                    self.drop_stale(id, "unlisten success");
                    return Ok(());
                };
                let Some(on_lifecycle) = conn.on_lifecycle.as_ref() else {
                    return Err(self.violation(id, "unlisten completion with no lifecycle handler"));
                };
                on_lifecycle(id, channel, ListenEvent::Unlisten);
                Ok(())
            }

            Completion::Notification {
                id,
                channel,
                payload,
            } => {
                let Some(conn) = self.registry.get(id) else {
                    self.drop_stale(id, "notification");
                    return Ok(());
                };
                let Some(on_notification) = conn.on_notification.as_ref() else {
                    return Err(self.violation(id, "notification with no notification handler"));
                };
                DispatcherMetrics::incr(&self.metrics.notifications_total);
                on_notification(id, channel, payload);
                Ok(())
            }
        }
    }

    // ── Helpers ──

    fn reject_invalid(&self, id: ConnectionId, on_error: &ErrorHandler) {
        DispatcherMetrics::incr(&self.metrics.invalid_id_errors);
        warn!(%id, "operation references unknown connection id");
        on_error(id, INVALID_CONNECTION_ID.to_string());
    }

    fn drop_stale(&self, id: ConnectionId, what: &str) {
        debug!(%id, what, "completion for unregistered connection; dropping");
    }

    fn violation(&self, id: ConnectionId, detail: &str) -> InvariantViolation {
        error!(%id, detail, "dispatcher invariant violated");
        InvariantViolation::new(id, detail, self.registry.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectParams;
    use crate::testing::MockDriver;

    fn ignore_error() -> ErrorHandler {
        Box::new(|_, _| {})
    }

    fn params() -> ConnectParams {
        ConnectParams::new("localhost", 5432, "db", "u", "p")
    }

    #[tokio::test]
    async fn test_unknown_id_rejected_without_native_call() {
        let driver = Arc::new(MockDriver::new());
        let (mut dispatcher, _handle) =
            Dispatcher::new(driver.clone(), DispatcherConfig::default());

        let seen: Arc<parking_lot::Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let op = dispatcher
            .prepare_command(Command::ExecuteSql {
                id: ConnectionId(99),
                sql: "DELETE FROM t".to_string(),
                on_error: Box::new(move |id, message| {
                    sink.lock().push(format!("{id}: {message}"));
                }),
                on_affected: Box::new(|_, _| {}),
            })
            .unwrap();

        assert!(op.is_none());
        assert_eq!(seen.lock().as_slice(), ["conn-99: Invalid connectionId"]);
        assert!(driver.calls().is_empty());
        assert_eq!(dispatcher.metrics.snapshot().invalid_id_errors, 1);
    }

    #[tokio::test]
    async fn test_connect_allocates_monotonic_ids() {
        let driver = Arc::new(MockDriver::new());
        let (mut dispatcher, _handle) =
            Dispatcher::new(driver.clone(), DispatcherConfig::default());

        for _ in 0..2 {
            let op = dispatcher
                .prepare_command(Command::Connect {
                    params: params(),
                    on_error: ignore_error(),
                    on_connected: Box::new(|_| {}),
                    on_lost: Box::new(|_, _| {}),
                })
                .unwrap();
            assert!(op.is_some());
        }
        assert!(dispatcher.registry.contains(ConnectionId(1)));
        assert!(dispatcher.registry.contains(ConnectionId(2)));
    }

    #[tokio::test]
    async fn test_continuation_without_query_is_fatal() {
        let driver = Arc::new(MockDriver::new());
        let (mut dispatcher, _handle) =
            Dispatcher::new(driver.clone(), DispatcherConfig::default());

        // Register a connection and mark it established by hand.
        let id = dispatcher.registry.allocate(Connection::new(
            ignore_error(),
            Box::new(|_| {}),
            Box::new(|_, _| {}),
        ));
        let conn = dispatcher.registry.get_mut(id).unwrap();
        conn.client = Some(crate::driver::ClientHandle(1));
        conn.listen = Some(ListenHandle(1));

        let err = dispatcher
            .prepare_command(Command::MoreQueryResults {
                id,
                on_error: ignore_error(),
                on_rows: Box::new(|_, _| {}),
            })
            .unwrap_err();
        assert_eq!(err.connection_id, id);
        assert!(err.detail.contains("no query in progress"));
        assert!(err.registry.contains("conn-1"));
    }

    #[tokio::test]
    async fn test_stale_completion_does_not_resurrect() {
        let driver = Arc::new(MockDriver::new());
        let (mut dispatcher, _handle) =
            Dispatcher::new(driver.clone(), DispatcherConfig::default());

        // A completion for an id that was never (or is no longer) registered
        // is dropped silently.
        dispatcher
            .route_completion(Completion::ExecuteOk {
                id: ConnectionId(42),
                affected: 3,
            })
            .unwrap();
        assert!(!dispatcher.registry.contains(ConnectionId(42)));
    }

    #[tokio::test]
    async fn test_loss_during_inflight_execute_drops_late_completion() {
        let driver = Arc::new(MockDriver::new());
        let (mut dispatcher, _handle) =
            Dispatcher::new(driver.clone(), DispatcherConfig::default());

        let lost: Arc<parking_lot::Mutex<Vec<ConnectionId>>> = Arc::default();
        let sink = Arc::clone(&lost);
        let id = dispatcher.registry.allocate(Connection::new(
            ignore_error(),
            Box::new(|_| {}),
            Box::new(move |id, _| sink.lock().push(id)),
        ));
        let conn = dispatcher.registry.get_mut(id).unwrap();
        conn.client = Some(ClientHandle(1));
        conn.listen = Some(ListenHandle(1));
        conn.on_affected = Some(Box::new(|_, _| panic!("stale completion delivered")));

        // The connection drops while the execute is still in flight.
        dispatcher
            .route_completion(Completion::ConnectionLost {
                id,
                message: "socket closed".to_string(),
            })
            .unwrap();
        assert_eq!(lost.lock().as_slice(), [id]);
        assert!(!dispatcher.registry.contains(id));

        // The execute completion arrives afterwards and must not resurrect
        // the record or reach its handler.
        dispatcher
            .route_completion(Completion::ExecuteOk { id, affected: 5 })
            .unwrap();
        assert!(!dispatcher.registry.contains(id));
    }

    #[tokio::test]
    async fn test_missing_handler_on_live_record_is_fatal() {
        let driver = Arc::new(MockDriver::new());
        let (mut dispatcher, _handle) =
            Dispatcher::new(driver.clone(), DispatcherConfig::default());

        let id = dispatcher.registry.allocate(Connection::new(
            ignore_error(),
            Box::new(|_| {}),
            Box::new(|_, _| {}),
        ));

        // No execute handler was ever recorded for this connection.
        let err = dispatcher
            .route_completion(Completion::ExecuteOk { id, affected: 1 })
            .unwrap_err();
        assert!(err.detail.contains("no execute handler"));
    }

    #[tokio::test]
    async fn test_reconcile_skips_unknown_ids() {
        let driver = Arc::new(MockDriver::new());
        let (mut dispatcher, _handle) =
            Dispatcher::new(driver.clone(), DispatcherConfig::default());

        let seen: Arc<parking_lot::Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        dispatcher.reconcile(vec![ListenRequest {
            connection_id: ConnectionId(7),
            channel: "jobs".to_string(),
            on_error: Box::new(move |id, message| {
                sink.lock().push(format!("{id}: {message}"));
            }),
            on_lifecycle: Box::new(|_, _, _| {}),
            on_notification: Box::new(|_, _, _| {}),
        }]);

        assert_eq!(seen.lock().as_slice(), ["conn-7: Invalid connectionId"]);
        assert_eq!(dispatcher.metrics.snapshot().listens_issued, 0);
        assert!(driver.calls().is_empty());
    }
}
