//! Relay server reactor.
//!
//! One thread waits on the [`Multiplexer`], routes each readiness event and
//! runs the matching handler: accept new clients, or drain a client's socket
//! and fan the text out to every other client.

use crate::codec::{broadcast_payload, decode, is_quit};
use crate::config::{get_namespaced_usize, ReactorSettings, DEFAULT_MAX_CONNECTIONS};
use crate::dispatch::{route, Route};
use crate::error::Error;
use crate::interface::{AdminRequest, RelayHandle};
use crate::multiplexer::{InterestKind, Multiplexer};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};
use crate::socket::{read_chunk, write_fully, ReadStatus};
use ::config::Config;

use mio::net::{TcpListener, TcpStream};
use mio::Token;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

// Internal constants for token management
const LISTENER_TOKEN: Token = Token(1);
const WAKE_TOKEN: Token = Token(2);
const CONNECTION_ID_RANGE_START: usize = 1000;

/// Events produced by [`RelayServer::turn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client was accepted and registered.
    Connected { id: ConnectionId, peer_addr: SocketAddr },
    /// A client was accepted and closed right away because the registry is
    /// full.
    Rejected { peer_addr: SocketAddr },
    /// A client sent text, which was broadcast to everybody else.
    Message { id: ConnectionId, text: String },
    /// A client was removed from the registry.
    Disconnected { id: ConnectionId },
    /// Shutdown was requested through a [`RelayHandle`].
    Shutdown,
}

/// Result of draining one readable connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Nothing was read, or the connection is no longer registered.
    Idle,
    /// Text was read and broadcast. One entry per buffer fill.
    Received(Vec<String>),
    /// The client sent the quit keyword. Everything read, the quit keyword
    /// included, was broadcast before the client was removed.
    Quit(Vec<String>),
    /// End-of-stream or a read error. Whatever was read before it was
    /// broadcast, then the client was removed.
    Disconnected(Vec<String>),
}

/// Per-recipient result of [`RelayServer::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<ConnectionId>,
}

/// Single-threaded text relay server.
///
/// # Configuration Keys
///
/// - `max_read_size`: capacity of each client's read buffer (default 1024)
/// - `poll_capacity`: readiness events fetched per wait (default 128)
/// - `max_connections`: clients accepted at once; extra ones are closed
///   right after accept (default 1024)
/// - `write_timeout_ms`: how long a recipient may stay unwritable during a
///   broadcast before it counts as failed (default 5000)
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    multiplexer: Multiplexer,
    registry: ConnectionRegistry,
    settings: ReactorSettings,
    max_connections: usize,
    next_id: usize,
    sender: Sender<AdminRequest>,
    receiver: Receiver<AdminRequest>,
}

// ============================================================================
// Constructors
// ============================================================================

impl RelayServer {
    /// Binds a listener on `addr` and prepares the reactor.
    pub fn bind<A: ToSocketAddrs>(config: &Config, addr: A) -> Result<Self, Error> {
        Self::bind_named(config, "", addr)
    }

    /// Like [`Self::bind`], looking up `{name}.{key}` before `{key}` in the
    /// configuration.
    pub fn bind_named<A: ToSocketAddrs>(config: &Config, name: &str, addr: A) -> Result<Self, Error> {
        let settings = ReactorSettings::from_config(config, name);
        let max_connections = get_namespaced_usize(config, name, "max_connections")
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let requested_addr = addr.to_socket_addrs()?.next().ok_or(Error::InvalidAddress)?;
        let mut listener = TcpListener::bind(requested_addr)?;
        let local_addr = listener.local_addr()?;

        let mut multiplexer = Multiplexer::new(settings.poll_capacity, WAKE_TOKEN)?;
        multiplexer.register(&mut listener, LISTENER_TOKEN, InterestKind::Acceptable)?;
        info!(%local_addr, max_connections, "Listening for connections");

        let (sender, receiver) = channel();

        Ok(Self {
            listener,
            local_addr,
            multiplexer,
            registry: ConnectionRegistry::new(),
            settings,
            max_connections,
            next_id: CONNECTION_ID_RANGE_START,
            sender,
            receiver,
        })
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl RelayServer {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Gets a thread-safe handle for inspecting and controlling the server
    /// from other threads.
    pub fn get_relay_handle(&self) -> RelayHandle {
        RelayHandle {
            registry: self.registry.clone(),
            sender: self.sender.clone(),
            waker: self.multiplexer.waker(),
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl RelayServer {
    /// Runs the reactor until shutdown is requested through a
    /// [`RelayHandle`] or a fatal error occurs.
    ///
    /// All connections are closed before returning.
    #[instrument(skip(self), fields(local_addr = %self.local_addr))]
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            let events = match self.turn() {
                Ok(events) => events,
                Err(err) => {
                    error!(?err, "Reactor failed");
                    self.close_all();
                    return Err(err);
                }
            };

            if events.contains(&ServerEvent::Shutdown) {
                info!("Shutting down");
                self.close_all();
                return Ok(());
            }
        }
    }

    /// Waits for readiness once and handles every ready event.
    pub fn turn(&mut self) -> Result<Vec<ServerEvent>, Error> {
        self.turn_timeout(None)
    }

    /// Like [`Self::turn`], but returns no events if nothing became ready
    /// within `timeout`.
    ///
    /// Only returns fatal errors. Failures of single connections are handled
    /// here and show up as [`ServerEvent::Disconnected`].
    pub fn turn_timeout(&mut self, timeout: Option<Duration>) -> Result<Vec<ServerEvent>, Error> {
        let ready = self.multiplexer.wait_timeout(timeout)?;
        let mut server_events = Vec::new();

        for event in ready {
            match route(&event, LISTENER_TOKEN, &self.registry) {
                Route::Accept => self.accept_pending(&mut server_events)?,
                Route::Relay(id) => match self.relay(id) {
                    RelayOutcome::Idle => (),
                    RelayOutcome::Received(messages) => {
                        server_events.extend(
                            messages
                                .into_iter()
                                .map(|text| ServerEvent::Message { id, text }),
                        );
                    }
                    RelayOutcome::Quit(messages) | RelayOutcome::Disconnected(messages) => {
                        server_events.extend(
                            messages
                                .into_iter()
                                .map(|text| ServerEvent::Message { id, text }),
                        );
                        server_events.push(ServerEvent::Disconnected { id });
                    }
                },
                Route::Wake => self.process_admin_requests(&mut server_events),
                Route::Skip => trace!(token = event.token.0, readiness = ?event.readiness, "Skipping event"),
            }
        }

        if !server_events.is_empty() {
            debug!(count = server_events.len(), "Handled events");
        }
        Ok(server_events)
    }
}

// ============================================================================
// Accept Handling
// ============================================================================

impl RelayServer {
    // Accepts until the listener would block. Readiness is edge-triggered, so
    // stopping earlier would leave pending clients without a new wake-up.
    #[instrument(skip(self, out))]
    fn accept_pending(&mut self, out: &mut Vec<ServerEvent>) -> Result<(), Error> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr, out),
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return Ok(()),
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, local_addr = %self.local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, local_addr = %self.local_addr, "Error accepting connection");
                        self.multiplexer.cancel(&mut self.listener, LISTENER_TOKEN);
                        return Err(Error::ListenerFailed(err));
                    }
                },
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer_addr: SocketAddr, out: &mut Vec<ServerEvent>) {
        if self.registry.len() >= self.max_connections {
            warn!(%peer_addr, limit = self.max_connections, "Registry full, rejecting connection");
            out.push(ServerEvent::Rejected { peer_addr });
            return;
        }

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer_addr, ?err, "Failed to set TCP_NODELAY");
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(%peer_addr, ?err, "Dropping accepted connection without local address");
                return;
            }
        };

        let id = self.allocate_id();
        if let Err(err) = self
            .multiplexer
            .register(&mut stream, id.token(), InterestKind::Readable)
        {
            warn!(%id, %peer_addr, ?err, "Failed to register connection");
            return;
        }

        let connection = Connection::new(
            id,
            stream,
            local_addr,
            peer_addr,
            self.settings.max_read_size,
        );
        info!(%id, %peer_addr, %local_addr, "{} connected", connection.label());
        self.registry.insert(connection);
        out.push(ServerEvent::Connected { id, peer_addr });
    }

    fn allocate_id(&mut self) -> ConnectionId {
        loop {
            let id = ConnectionId(self.next_id);
            self.next_id = self
                .next_id
                .checked_add(1)
                .unwrap_or(CONNECTION_ID_RANGE_START);
            if !self.registry.contains(id) && !self.multiplexer.is_registered(id.token()) {
                return id;
            }
        }
    }
}

// ============================================================================
// Message Relay
// ============================================================================

impl RelayServer {
    /// Drains a readable connection and broadcasts what it sent.
    ///
    /// Each buffer fill is decoded and broadcast on its own, so a long
    /// message reaches the other clients in `max_read_size` pieces.
    #[instrument(skip(self))]
    pub fn relay(&mut self, id: ConnectionId) -> RelayOutcome {
        let capacity = self.settings.max_read_size;
        let mut messages = Vec::new();

        loop {
            let read = self.registry.with_connection(id, |io| {
                let status = read_chunk(&mut io.stream, &mut io.read_buf, capacity);
                let text = (!io.read_buf.is_empty()).then(|| decode(&io.read_buf));
                (status, text)
            });
            let Some((status, text)) = read else {
                debug!(%id, "Connection not found for readable event");
                return RelayOutcome::Idle;
            };

            // Bytes read before end-of-stream or an error are still relayed
            if let Some(text) = text {
                debug!(%id, len = text.len(), "Received message");
                self.broadcast(id, &text);

                let quit = is_quit(&text);
                messages.push(text);
                if quit {
                    info!(%id, "Client asked to quit");
                    self.disconnect(id);
                    return RelayOutcome::Quit(messages);
                }
            }

            match status {
                ReadStatus::Drained => break,
                ReadStatus::Full => continue,
                ReadStatus::Closed => {
                    info!(%id, "Connection closed by peer");
                    self.disconnect(id);
                    return RelayOutcome::Disconnected(messages);
                }
                ReadStatus::Failed(err) => {
                    if err.kind() == ErrorKind::ConnectionReset {
                        warn!(%id, "Connection reset");
                    } else {
                        warn!(%id, ?err, "Error reading from socket");
                    }
                    self.disconnect(id);
                    return RelayOutcome::Disconnected(messages);
                }
            }
        }

        if messages.is_empty() {
            RelayOutcome::Idle
        } else {
            RelayOutcome::Received(messages)
        }
    }
}

// ============================================================================
// Broadcast
// ============================================================================

impl RelayServer {
    /// Sends `text`, prefixed with the sender's label, to every connection
    /// except `sender`.
    ///
    /// Recipients are taken from a snapshot of the registry. A recipient that
    /// cannot be written to is shut down and reported as failed; it is
    /// removed once its next readiness event shows end-of-stream. Delivery to
    /// the other recipients continues either way.
    #[instrument(skip(self, text))]
    pub fn broadcast(&mut self, sender: ConnectionId, text: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let Some(label) = self.registry.label_of(sender) else {
            warn!(%sender, "Sender not found when broadcasting");
            return report;
        };
        let payload = broadcast_payload(&label, text);
        let stall_limit = self.settings.write_timeout;

        for id in self.registry.snapshot_ids() {
            if id == sender {
                continue;
            }

            let written = self
                .registry
                .with_connection(id, |io| write_fully(&mut io.stream, &payload, stall_limit));
            match written {
                None => trace!(%id, "Recipient left during broadcast"),
                Some(Ok(())) => report.delivered.push(id),
                Some(Err(err)) => {
                    if err.kind() == ErrorKind::BrokenPipe {
                        warn!(%id, "Broken pipe");
                    } else {
                        warn!(%id, ?err, "Error writing to recipient");
                    }
                    self.registry.shutdown(id, Shutdown::Both);
                    report.failed.push(id);
                }
            }
        }

        debug!(
            len = payload.len(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast message"
        );
        report
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl RelayServer {
    /// Cancels and removes a connection, closing its socket.
    ///
    /// Returns false if the connection was already gone, in which case
    /// nothing happens.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.registry.remove(id) else {
            return false;
        };
        self.multiplexer.cancel(&mut connection.io().stream, id.token());
        info!(%id, peer_addr = %connection.peer_addr(), "{} disconnected", connection.label());
        true
    }

    /// Closes every connection and the listener.
    #[instrument(skip(self))]
    pub fn close_all(&mut self) {
        for id in self.registry.snapshot_ids() {
            self.disconnect(id);
        }
        self.multiplexer.cancel(&mut self.listener, LISTENER_TOKEN);
    }

    fn process_admin_requests(&mut self, out: &mut Vec<ServerEvent>) {
        let requests: Vec<AdminRequest> = self.receiver.try_iter().collect();

        for request in requests {
            match request {
                AdminRequest::Disconnect { id } => {
                    if self.disconnect(id) {
                        out.push(ServerEvent::Disconnected { id });
                    }
                }
                AdminRequest::Shutdown => out.push(ServerEvent::Shutdown),
            }
        }
    }
}
