use thiserror::Error;

/// The error type for textrelay operations.
///
/// Only setup failures and failures of the reactor itself are reported as
/// errors. Failures on a single client connection are recovered locally: the
/// connection is dropped from the registry and the loop keeps running, so
/// they show up as [`ServerEvent::Disconnected`](crate::ServerEvent) or as a
/// failed entry in a [`BroadcastReport`](crate::BroadcastReport) instead.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Setup Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // ============================================================================
    // Fatal Reactor Errors
    // ============================================================================

    /// The readiness mechanism failed. The reactor cannot continue.
    #[error("Poll error: {0}")]
    Poll(std::io::Error),

    /// The listening socket failed. The server cannot accept anymore and must
    /// shut down.
    #[error("Listener failed: {0}")]
    ListenerFailed(std::io::Error),

    // ============================================================================
    // Client Errors
    // ============================================================================

    /// A line was handed to a [`ClientInterface`](crate::ClientInterface)
    /// whose client has already been dropped.
    #[error("Client is closed")]
    ClientClosed,
}

impl Error {
    /// Returns true if the reactor that produced this error has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Poll(_) | Error::ListenerFailed(_))
    }
}
