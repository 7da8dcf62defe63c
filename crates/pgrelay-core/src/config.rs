//! Dispatcher configuration types.

use std::fmt;
use std::time::Duration;

/// Parameters for establishing a database connection.
///
/// Carried by the `Connect` command and handed to the driver adapter as-is.
/// The `Debug` rendering redacts the password.
#[derive(Clone)]
pub struct ConnectParams {
    /// Host name or address of the database server.
    pub host: String,
    /// TCP port of the database server.
    pub port: u16,
    /// Database name to connect to.
    pub database: String,
    /// User name for authentication.
    pub user: String,
    /// Password for authentication.
    pub password: String,
}

impl ConnectParams {
    /// Creates connect parameters.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for the [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Timeout applied to native connect operations.
    ///
    /// Connect is the only operation with a timeout; all other native calls
    /// run to completion on the driver's own schedule.
    pub connect_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(15_000),
        }
    }
}
