//! # `pgrelay`
//!
//! Fire-and-forget PostgreSQL command dispatch with LISTEN/NOTIFY
//! subscriptions.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pgrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let driver: Arc<dyn PgDriver> = Arc::new(MyDriver::new());
//!     let (dispatcher, handle) = Dispatcher::new(driver, DispatcherConfig::default());
//!     let running = dispatcher.spawn();
//!
//!     handle.connect(
//!         Box::new(|id, message| eprintln!("{id}: {message}")),
//!         Box::new(|id| println!("connected as {id}")),
//!         Box::new(|id, message| eprintln!("{id} lost: {message}")),
//!         ConnectParams::new("localhost", 5432, "app", "app", "secret"),
//!     );
//!
//!     handle.shutdown();
//!     running.await.unwrap().unwrap();
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export the dispatcher core
pub use pgrelay_core::*;

/// Commonly used types and traits.
///
/// ```rust,ignore
/// use pgrelay::prelude::*;
/// ```
pub mod prelude {
    // Dispatch
    pub use pgrelay_core::command::{Command, DispatcherHandle};
    pub use pgrelay_core::config::{ConnectParams, DispatcherConfig};
    pub use pgrelay_core::dispatcher::Dispatcher;

    // Driver seam
    pub use pgrelay_core::driver::{
        ClientHandle, CursorHandle, ListenHandle, LostSignal, NotificationSink, PgDriver, Row,
    };

    // Errors and events
    pub use pgrelay_core::error::{DriverError, InvariantViolation, INVALID_CONNECTION_ID};
    pub use pgrelay_core::event::ListenEvent;

    // Registry and subscriptions
    pub use pgrelay_core::registry::ConnectionId;
    pub use pgrelay_core::subscription::ListenRequest;

    // Standard library re-exports for convenience
    pub use std::sync::Arc;
    pub use std::time::Duration;
}
