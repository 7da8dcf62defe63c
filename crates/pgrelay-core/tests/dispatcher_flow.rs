//! End-to-end dispatcher flows over the mock driver.
//!
//! Each test wires handler callbacks to a channel and drives the running
//! dispatcher purely through the fire-and-forget handle, the way an
//! application would.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use pgrelay_core::command::DispatcherHandle;
use pgrelay_core::config::{ConnectParams, DispatcherConfig};
use pgrelay_core::dispatcher::Dispatcher;
use pgrelay_core::driver::Row;
use pgrelay_core::error::InvariantViolation;
use pgrelay_core::event::ListenEvent;
use pgrelay_core::metrics::DispatcherMetrics;
use pgrelay_core::registry::{
    AffectedHandler, ConnectedHandler, ConnectionId, ConnectionLostHandler, DisconnectedHandler,
    ErrorHandler, LifecycleHandler, NotificationHandler, RowsHandler,
};
use pgrelay_core::subscription::ListenRequest;
use pgrelay_core::testing::{DriverCall, MockDriver};

/// Everything a test application can hear back from the dispatcher.
#[derive(Debug, Clone, PartialEq)]
enum Msg {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Rows(ConnectionId, Vec<Row>),
    Affected(ConnectionId, u64),
    Error(ConnectionId, String),
    Lost(ConnectionId, String),
    Lifecycle(ConnectionId, String, ListenEvent),
    Notification(ConnectionId, String, String),
}

struct App {
    tx: mpsc::UnboundedSender<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
}

impl App {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    async fn recv(&mut self) -> Msg {
        self.rx.recv().await.expect("dispatcher dropped all handlers")
    }

    fn on_error(&self) -> ErrorHandler {
        let tx = self.tx.clone();
        Box::new(move |id, message| {
            let _ = tx.send(Msg::Error(id, message));
        })
    }

    fn on_connected(&self) -> ConnectedHandler {
        let tx = self.tx.clone();
        Box::new(move |id| {
            let _ = tx.send(Msg::Connected(id));
        })
    }

    fn on_lost(&self) -> ConnectionLostHandler {
        let tx = self.tx.clone();
        Box::new(move |id, message| {
            let _ = tx.send(Msg::Lost(id, message));
        })
    }

    fn on_disconnected(&self) -> DisconnectedHandler {
        let tx = self.tx.clone();
        Box::new(move |id| {
            let _ = tx.send(Msg::Disconnected(id));
        })
    }

    fn on_rows(&self) -> RowsHandler {
        let tx = self.tx.clone();
        Box::new(move |id, rows| {
            let _ = tx.send(Msg::Rows(id, rows));
        })
    }

    fn on_affected(&self) -> AffectedHandler {
        let tx = self.tx.clone();
        Box::new(move |id, affected| {
            let _ = tx.send(Msg::Affected(id, affected));
        })
    }

    fn on_lifecycle(&self) -> LifecycleHandler {
        let tx = self.tx.clone();
        Box::new(move |id, channel, event| {
            let _ = tx.send(Msg::Lifecycle(id, channel, event));
        })
    }

    fn on_notification(&self) -> NotificationHandler {
        let tx = self.tx.clone();
        Box::new(move |id, channel, payload| {
            let _ = tx.send(Msg::Notification(id, channel, payload));
        })
    }

    fn listen_request(&self, id: ConnectionId, channel: &str) -> ListenRequest {
        ListenRequest {
            connection_id: id,
            channel: channel.to_string(),
            on_error: self.on_error(),
            on_lifecycle: self.on_lifecycle(),
            on_notification: self.on_notification(),
        }
    }

    /// Connects and waits for the allocated id.
    async fn connect(&mut self, handle: &DispatcherHandle) -> ConnectionId {
        handle.connect(
            self.on_error(),
            self.on_connected(),
            self.on_lost(),
            params(),
        );
        match self.recv().await {
            Msg::Connected(id) => id,
            other => panic!("expected connect success, got {other:?}"),
        }
    }

    /// Executes a throwaway statement and waits for its completion, so every
    /// inbox message enqueued before it has been processed.
    async fn barrier(&mut self, handle: &DispatcherHandle, id: ConnectionId) {
        handle.execute_sql(self.on_error(), self.on_affected(), id, "SELECT 1");
        match self.recv().await {
            Msg::Affected(got, _) => assert_eq!(got, id),
            other => panic!("expected barrier completion, got {other:?}"),
        }
    }
}

fn params() -> ConnectParams {
    ConnectParams::new("localhost", 5432, "app", "app", "secret")
}

type Running = tokio::task::JoinHandle<Result<(), InvariantViolation>>;

fn start(driver: Arc<MockDriver>) -> (Running, DispatcherHandle, Arc<DispatcherMetrics>) {
    let (dispatcher, handle) = Dispatcher::new(driver, DispatcherConfig::default());
    let metrics = dispatcher.metrics();
    (dispatcher.spawn(), handle, metrics)
}

#[tokio::test]
async fn test_connect_query_paginate_disconnect() {
    let driver = Arc::new(MockDriver::new().with_rows(vec![json!(1), json!(2), json!(3)]));
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    assert_eq!(id, ConnectionId(1));

    handle.query(app.on_error(), app.on_rows(), id, "SELECT n FROM t", 2);
    assert_eq!(app.recv().await, Msg::Rows(id, vec![json!(1), json!(2)]));

    handle.more_query_results(app.on_error(), app.on_rows(), id);
    assert_eq!(app.recv().await, Msg::Rows(id, vec![json!(3)]));

    // The empty batch ends the iteration.
    handle.more_query_results(app.on_error(), app.on_rows(), id);
    assert_eq!(app.recv().await, Msg::Rows(id, vec![]));

    handle.disconnect(app.on_error(), app.on_disconnected(), id, true);
    assert_eq!(app.recv().await, Msg::Disconnected(id));

    // The id is gone; further use is rejected without a native call.
    let before = driver.calls().len();
    handle.execute_sql(app.on_error(), app.on_affected(), id, "SELECT 1");
    assert_eq!(
        app.recv().await,
        Msg::Error(id, "Invalid connectionId".to_string())
    );
    assert_eq!(driver.calls().len(), before);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_id_is_rejected_for_every_command() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let bogus = ConnectionId(99);
    handle.disconnect(app.on_error(), app.on_disconnected(), bogus, false);
    handle.query(app.on_error(), app.on_rows(), bogus, "SELECT 1", 10);
    handle.more_query_results(app.on_error(), app.on_rows(), bogus);
    handle.execute_sql(app.on_error(), app.on_affected(), bogus, "SELECT 1");
    handle.set_listeners(vec![app.listen_request(bogus, "jobs")]);

    for _ in 0..5 {
        assert_eq!(
            app.recv().await,
            Msg::Error(bogus, "Invalid connectionId".to_string())
        );
    }
    assert!(driver.calls().is_empty());
    assert_eq!(metrics.snapshot().invalid_id_errors, 5);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_registered_but_unconnected_id_is_rejected() {
    let driver = Arc::new(MockDriver::new());
    driver.hang_connect();
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    // The id is allocated eagerly, but callers can only learn it from the
    // connect success that never arrives; anyone guessing it is rejected.
    handle.connect(app.on_error(), app.on_connected(), app.on_lost(), params());
    handle.execute_sql(
        app.on_error(),
        app.on_affected(),
        ConnectionId(1),
        "SELECT 1",
    );
    assert_eq!(
        app.recv().await,
        Msg::Error(ConnectionId(1), "Invalid connectionId".to_string())
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let driver = Arc::new(MockDriver::new());
    driver.hang_connect();
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    handle.connect(app.on_error(), app.on_connected(), app.on_lost(), params());
    assert_eq!(
        app.recv().await,
        Msg::Error(ConnectionId(1), "timeout after 15000ms".to_string())
    );

    // The failed record was removed; the id never becomes usable.
    handle.execute_sql(
        app.on_error(),
        app.on_affected(),
        ConnectionId(1),
        "SELECT 1",
    );
    assert_eq!(
        app.recv().await,
        Msg::Error(ConnectionId(1), "Invalid connectionId".to_string())
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_failure_reaches_error_handler() {
    let driver = Arc::new(MockDriver::new());
    driver.fail_connect("refused");
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    handle.connect(app.on_error(), app.on_connected(), app.on_lost(), params());
    assert_eq!(
        app.recv().await,
        Msg::Error(ConnectionId(1), "connect failed: refused".to_string())
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_statement_failure_is_annotated_with_sql() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    driver.fail_sql("syntax error");
    handle.execute_sql(app.on_error(), app.on_affected(), id, "SELEC 1");
    assert_eq!(
        app.recv().await,
        Msg::Error(id, "syntax error; sql: SELEC 1".to_string())
    );

    // The connection survives a statement failure.
    driver.clear_sql_failure();
    handle.execute_sql(app.on_error(), app.on_affected(), id, "SELECT 1");
    assert_eq!(app.recv().await, Msg::Affected(id, 0));

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_continuation_without_query_is_fatal() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    handle.more_query_results(app.on_error(), app.on_rows(), id);

    let violation = running.await.unwrap().unwrap_err();
    assert_eq!(violation.connection_id, id);
    assert!(violation.detail.contains("no query in progress"));
    assert!(violation.registry.contains("conn-1"));
}

#[tokio::test]
async fn test_listen_lifecycle_and_notification() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    handle.set_listeners(vec![app.listen_request(id, "jobs")]);
    assert_eq!(
        app.recv().await,
        Msg::Lifecycle(id, "jobs".to_string(), ListenEvent::Listen)
    );

    // Payloads published by the driver reach the notification handler.
    let sinks = driver.notification_sinks();
    assert_eq!(sinks.len(), 1);
    sinks[0].publish("jobs", "{\"job\":17}");
    assert_eq!(
        app.recv().await,
        Msg::Notification(id, "jobs".to_string(), "{\"job\":17}".to_string())
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconciliation_is_idempotent() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    handle.set_listeners(vec![app.listen_request(id, "jobs")]);
    assert_eq!(
        app.recv().await,
        Msg::Lifecycle(id, "jobs".to_string(), ListenEvent::Listen)
    );

    // Re-declaring the identical snapshot issues nothing.
    handle.set_listeners(vec![app.listen_request(id, "jobs")]);
    app.barrier(&handle, id).await;
    let snap = metrics.snapshot();
    assert_eq!(snap.listens_issued, 1);
    assert_eq!(snap.unlistens_issued, 0);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_channel_replacement_unlistens_before_listening() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    handle.set_listeners(vec![app.listen_request(id, "alpha")]);
    assert_eq!(
        app.recv().await,
        Msg::Lifecycle(id, "alpha".to_string(), ListenEvent::Listen)
    );

    handle.set_listeners(vec![app.listen_request(id, "beta")]);
    assert_eq!(
        app.recv().await,
        Msg::Lifecycle(id, "alpha".to_string(), ListenEvent::Unlisten)
    );
    assert_eq!(
        app.recv().await,
        Msg::Lifecycle(id, "beta".to_string(), ListenEvent::Listen)
    );

    let calls = driver.calls();
    let tail: Vec<_> = calls.iter().rev().take(2).rev().collect();
    assert!(matches!(
        tail[0],
        DriverCall::Unlisten { sql, .. } if sql == "UNLISTEN \"alpha\""
    ));
    assert!(matches!(
        tail[1],
        DriverCall::Listen { sql, .. } if sql == "LISTEN \"beta\""
    ));

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_empty_snapshot_unlistens_everything() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    handle.set_listeners(vec![app.listen_request(id, "jobs")]);
    assert_eq!(
        app.recv().await,
        Msg::Lifecycle(id, "jobs".to_string(), ListenEvent::Listen)
    );

    handle.set_listeners(vec![]);
    assert_eq!(
        app.recv().await,
        Msg::Lifecycle(id, "jobs".to_string(), ListenEvent::Unlisten)
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_lost_removes_record_for_good() {
    let driver = Arc::new(MockDriver::new());
    let (running, handle, metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    let signals = driver.lost_signals();
    assert_eq!(signals.len(), 1);

    signals[0].fire("socket closed");
    assert_eq!(app.recv().await, Msg::Lost(id, "socket closed".to_string()));

    // A stale second loss event is dropped, never resurrecting the record.
    signals[0].fire("socket closed again");
    handle.execute_sql(app.on_error(), app.on_affected(), id, "SELECT 1");
    assert_eq!(
        app.recv().await,
        Msg::Error(id, "Invalid connectionId".to_string())
    );
    assert_eq!(metrics.snapshot().connections_lost, 1);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commands_in_one_batch_reach_driver_in_order() {
    let driver = Arc::new(MockDriver::new().with_affected(2));
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    handle.submit(vec![
        pgrelay_core::command::Command::ExecuteSql {
            id,
            sql: "UPDATE t SET x = 1".to_string(),
            on_error: app.on_error(),
            on_affected: app.on_affected(),
        },
        pgrelay_core::command::Command::Disconnect {
            id,
            discard: false,
            on_error: app.on_error(),
            on_disconnected: app.on_disconnected(),
        },
    ]);

    // The disconnect must not overtake the execute, even with the batch
    // running off the control task on a multi-thread scheduler; a reordering
    // would tear down the record first and drop the execute result as stale.
    assert_eq!(app.recv().await, Msg::Affected(id, 2));
    assert_eq!(app.recv().await, Msg::Disconnected(id));

    let calls = driver.calls();
    assert_eq!(calls.len(), 3);
    assert!(matches!(calls[1], DriverCall::ExecuteSql { .. }));
    assert!(matches!(
        calls[2],
        DriverCall::Disconnect { discard: false, .. }
    ));

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disconnect_failure_leaves_connection_usable() {
    let driver = Arc::new(MockDriver::new().with_affected(1));
    let (running, handle, _metrics) = start(Arc::clone(&driver));
    let mut app = App::new();

    let id = app.connect(&handle).await;
    driver.fail_disconnect();
    handle.disconnect(app.on_error(), app.on_disconnected(), id, true);
    assert_eq!(
        app.recv().await,
        Msg::Error(id, "connection closed".to_string())
    );

    // The record survives the failed disconnect; the connection keeps working.
    handle.execute_sql(app.on_error(), app.on_affected(), id, "SELECT 1");
    assert_eq!(app.recv().await, Msg::Affected(id, 1));

    driver.clear_disconnect_failure();
    handle.disconnect(app.on_error(), app.on_disconnected(), id, true);
    assert_eq!(app.recv().await, Msg::Disconnected(id));

    handle.shutdown();
    running.await.unwrap().unwrap();
}
