use crate::error::Error;
use crate::registry::{ConnectionId, ConnectionRegistry};
use mio::Waker;
use std::net::SocketAddr;
use std::sync::{mpsc::Sender, Arc};
use tracing::{debug, warn};

// Internal request type for cross-thread server control
#[derive(Debug)]
pub(crate) enum AdminRequest {
    Disconnect { id: ConnectionId },
    Shutdown,
}

/// Thread-safe handle to a running [`RelayServer`](crate::RelayServer).
///
/// Obtain one with
/// [`RelayServer::get_relay_handle()`](crate::RelayServer::get_relay_handle).
/// Reads go straight to the shared registry. Requests that change the
/// server are queued and applied by the reactor thread on its next wake-up.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) sender: Sender<AdminRequest>,
    pub(crate) waker: Arc<Waker>,
}

impl RelayHandle {
    /// Number of registered clients.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Ids and peer addresses of the registered clients.
    pub fn connections(&self) -> Vec<(ConnectionId, SocketAddr)> {
        self.registry.snapshot()
    }

    /// Queues a client to be disconnected. Unknown ids are ignored.
    pub fn disconnect(&self, id: ConnectionId) {
        self.request(AdminRequest::Disconnect { id });
    }

    /// Asks [`RelayServer::run()`](crate::RelayServer::run) to close every
    /// connection and return.
    pub fn shutdown(&self) {
        self.request(AdminRequest::Shutdown);
    }

    fn request(&self, request: AdminRequest) {
        if self.sender.send(request).is_err() {
            debug!("Relay server is gone, dropping request");
            return;
        }
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake relay server");
        }
    }
}

/// Thread-safe sender of outbound lines for a
/// [`RelayClient`](crate::RelayClient).
///
/// Lines are written by the client's own event loop, in the order they were
/// handed over.
#[derive(Debug, Clone)]
pub struct ClientInterface {
    pub(crate) sender: Sender<String>,
    pub(crate) waker: Arc<Waker>,
}

impl ClientInterface {
    /// Queues one line for sending. Sending the quit keyword closes the
    /// client once it is written.
    ///
    /// Fails with [`Error::ClientClosed`] once the client has closed.
    pub fn send(&self, line: impl Into<String>) -> Result<(), Error> {
        self.sender
            .send(line.into())
            .map_err(|_| Error::ClientClosed)?;
        self.waker.wake()?;
        Ok(())
    }
}
