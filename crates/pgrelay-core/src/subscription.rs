//! Subscription declarations and desired-vs-active reconciliation.
//!
//! Callers declare the full set of desired subscriptions each cycle; the
//! dispatcher diffs it against the registry's active set and issues only the
//! corrective LISTEN/UNLISTEN operations. The diff itself is pure and lives
//! here; issuing is the dispatcher's job.
//!
//! One channel per connection: a snapshot that names a different channel for
//! an already-subscribed connection replaces it (one UNLISTEN, one LISTEN).
//! If a snapshot names the same connection more than once, the last
//! declaration wins.

use std::collections::HashMap;
use std::fmt;

use crate::registry::{ConnectionId, ErrorHandler, LifecycleHandler, NotificationHandler};

/// Declaration that a connection should be subscribed to a channel.
pub struct ListenRequest {
    /// The connection to subscribe.
    pub connection_id: ConnectionId,
    /// The notification channel to listen on.
    pub channel: String,
    /// Error handler for failures of the LISTEN/UNLISTEN statements.
    pub on_error: ErrorHandler,
    /// Lifecycle handler fired on listen/unlisten transitions.
    pub on_lifecycle: LifecycleHandler,
    /// Handler fired for each published payload.
    pub on_notification: NotificationHandler,
}

impl fmt::Debug for ListenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenRequest")
            .field("connection_id", &self.connection_id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// The corrective operations one reconciliation cycle must issue.
///
/// Entries are sorted by connection id so cycles are deterministic.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ListenDelta {
    /// Active but no longer desired: `(connection, channel)` to UNLISTEN.
    pub removed: Vec<(ConnectionId, String)>,
    /// Desired but not active: `(connection, channel)` to LISTEN.
    pub added: Vec<(ConnectionId, String)>,
    /// Desired and already active; no native call is issued.
    pub unchanged: Vec<ConnectionId>,
}

/// Diffs the active subscription set against the desired one.
///
/// A connection whose desired channel differs from its active channel shows
/// up in both `removed` (old channel) and `added` (new channel).
pub(crate) fn diff_listens(
    active: &HashMap<ConnectionId, String>,
    desired: &HashMap<ConnectionId, String>,
) -> ListenDelta {
    let mut delta = ListenDelta::default();

    for (&id, channel) in active {
        if desired.get(&id) != Some(channel) {
            delta.removed.push((id, channel.clone()));
        }
    }
    for (&id, channel) in desired {
        if active.get(&id) == Some(channel) {
            delta.unchanged.push(id);
        } else {
            delta.added.push((id, channel.clone()));
        }
    }

    delta.removed.sort_by_key(|(id, _)| id.0);
    delta.added.sort_by_key(|(id, _)| id.0);
    delta.unchanged.sort_by_key(|id| id.0);
    delta
}
