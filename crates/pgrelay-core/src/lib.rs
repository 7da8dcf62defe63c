//! # `pgrelay-core`
//!
//! A stateful asynchronous command dispatcher for PostgreSQL work.
//!
//! Applications submit fire-and-forget commands (connect, disconnect, query
//! with paginated continuation, execute) and declare desired LISTEN
//! subscriptions; results and notifications flow back through handler
//! callbacks the caller supplies per operation. Connections are addressed by
//! opaque, monotonically allocated ids.
//!
//! ## Architecture
//!
//! ```text
//! DispatcherHandle --commands/subscriptions--> inbox --> Dispatcher (one task)
//!                                                ^          | owns ConnectionRegistry
//!                                                |          v
//!                                           completions   PgDriver calls (spawned)
//! ```
//!
//! One task owns all state; native driver calls are spawned and resolve by
//! posting exactly one completion back onto the same inbox. Unknown
//! connection ids are recoverable caller errors; a completion the dispatcher
//! cannot interpret stops the loop with an
//! [`InvariantViolation`](error::InvariantViolation).

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Caller-facing commands and the dispatch handle.
pub mod command;

/// Connection parameters and dispatcher configuration.
pub mod config;

/// The dispatcher loop, command processing, and completion routing.
pub mod dispatcher;

/// The native driver adapter trait and opaque handles.
pub mod driver;

/// Driver and invariant error types.
pub mod error;

/// Lifecycle event tags and internal dispatcher messages.
pub mod event;

/// Dispatcher metrics counters.
pub mod metrics;

/// Connection registry and per-connection state.
pub mod registry;

/// Subscription declarations and reconciliation.
pub mod subscription;

/// Testing utilities (mock driver, call log).
pub mod testing;
