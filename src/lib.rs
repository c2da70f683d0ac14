//! textrelay - a single-threaded, readiness-driven text broadcast relay
//!
//! Every client connected to a [`RelayServer`] gets the text sent by every
//! other client, prefixed with the sender's label (`Client [<port>]: `). A
//! client that sends `quit` has its line forwarded one last time and is then
//! disconnected.
//!
//! The server is a reactor: one thread waits on a [`Multiplexer`] built on
//! mio and handles accept and read readiness as it arrives. [`RelayClient`]
//! is the matching client with its own small reactor.
//!
//! There is no framing. Whatever one wake-up drains from a socket is one
//! message, which may hold half a line or several lines.

// Internal-only modules
pub(crate) mod client;
pub(crate) mod config;
pub(crate) mod dispatch;
pub(crate) mod error;
pub(crate) mod interface;
pub(crate) mod multiplexer;
pub(crate) mod registry;
pub(crate) mod server;
pub(crate) mod socket;

pub mod codec;

// These are the intended public API
pub use client::{spawn_input_producer, ClientEvent, ClientState, CloseReason, RelayClient};
pub use codec::QUIT;
pub use error::Error;
pub use interface::{ClientInterface, RelayHandle};
pub use multiplexer::{InterestKind, Multiplexer, Readiness, ReadinessEvent};
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use server::{BroadcastReport, RelayOutcome, RelayServer, ServerEvent};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::client::{ClientEvent, ClientState, CloseReason, RelayClient};
    pub use crate::error::Error;
    pub use crate::interface::{ClientInterface, RelayHandle};
    pub use crate::registry::ConnectionId;
    pub use crate::server::{BroadcastReport, RelayOutcome, RelayServer, ServerEvent};
}
