//! Relay client.
//!
//! A small reactor with a single socket: it waits for the non-blocking
//! connect to finish, then for inbound text. Outbound lines come from a
//! [`ClientInterface`], usually fed by an input producer thread, and are
//! written by the event loop itself.

use crate::codec::{decode, is_quit};
use crate::config::ReactorSettings;
use crate::error::Error;
use crate::interface::ClientInterface;
use crate::multiplexer::{InterestKind, Multiplexer, Readiness};
use crate::socket::{read_chunk, write_fully, ReadStatus};
use ::config::Config;

use mio::net::TcpStream;
use mio::Token;
use std::io::{BufRead, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

// Internal constants for token management
const SERVER_TOKEN: Token = Token(1);
const WAKE_TOKEN: Token = Token(2);

/// Lifecycle of a [`RelayClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for the non-blocking connect to complete.
    Connecting,
    /// Connected; the read interest is being set up.
    Connected,
    /// Sending and receiving text.
    Exchanging,
    /// Done. No more events are produced; the socket is closed when the
    /// client is dropped.
    Closed,
}

/// Why a [`RelayClient`] closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection could not be established.
    ConnectionFailed,
    /// The server closed the connection, or reading from it failed.
    ServerClosed,
    /// The quit keyword was sent.
    Quit,
    /// Writing an outbound line failed.
    SendFailed,
}

/// Events produced by [`RelayClient::fetch_events()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client is closed; there is nothing left to wait for.
    Inactive,
    /// The connection to the server is established.
    Connected,
    /// Text received from the server.
    Message(String),
    /// The client closed.
    Closed(CloseReason),
}

/// Text relay client.
///
/// # Configuration Keys
///
/// - `max_read_size`: read buffer capacity (default 1024)
/// - `poll_capacity`: readiness events fetched per wait (default 128)
/// - `write_timeout_ms`: how long the socket may stay unwritable while
///   sending a line (default 5000)
pub struct RelayClient {
    stream: TcpStream,
    server_addr: SocketAddr,
    multiplexer: Multiplexer,
    state: ClientState,
    settings: ReactorSettings,
    read_buf: Vec<u8>,
    sender: Sender<String>,
    receiver: Option<Receiver<String>>,
    input: Option<Box<dyn BufRead + Send>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl RelayClient {
    /// Starts connecting to `addr`. The connection completes asynchronously
    /// and is reported as [`ClientEvent::Connected`].
    pub fn connect<A: ToSocketAddrs>(config: &Config, addr: A) -> Result<Self, Error> {
        Self::connect_named(config, "", addr)
    }

    /// Like [`Self::connect`], looking up `{name}.{key}` before `{key}` in the
    /// configuration.
    pub fn connect_named<A: ToSocketAddrs>(config: &Config, name: &str, addr: A) -> Result<Self, Error> {
        let settings = ReactorSettings::from_config(config, name);
        let server_addr = addr.to_socket_addrs()?.next().ok_or(Error::InvalidAddress)?;

        let mut stream = TcpStream::connect(server_addr)?;
        let mut multiplexer = Multiplexer::new(settings.poll_capacity, WAKE_TOKEN)?;
        multiplexer.register(&mut stream, SERVER_TOKEN, InterestKind::Connectable)?;
        info!(%server_addr, "Initiating connection");

        let (sender, receiver) = channel();

        Ok(Self {
            stream,
            server_addr,
            multiplexer,
            state: ClientState::Connecting,
            read_buf: Vec::with_capacity(settings.max_read_size),
            settings,
            sender,
            receiver: Some(receiver),
            input: None,
        })
    }

    /// Sets the source of outbound lines. A producer thread reading it is
    /// started once the connection is established.
    pub fn with_input<R: BufRead + Send + 'static>(mut self, input: R) -> Self {
        self.input = Some(Box::new(input));
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl RelayClient {
    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// The local address of the connection, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state {
            ClientState::Connecting | ClientState::Closed => None,
            ClientState::Connected | ClientState::Exchanging => self.stream.local_addr().ok(),
        }
    }

    /// Gets a thread-safe interface for sending lines from other threads.
    pub fn get_client_interface(&self) -> ClientInterface {
        ClientInterface {
            sender: self.sender.clone(),
            waker: self.multiplexer.waker(),
        }
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl RelayClient {
    /// Blocks until client events are available and returns them.
    ///
    /// Returns [`ClientEvent::Inactive`] once the client is closed.
    pub fn fetch_events(&mut self) -> Result<Vec<ClientEvent>, Error> {
        loop {
            let events = self.fetch_events_timeout(None)?;
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }

    /// Like [`Self::fetch_events`], but returns no events if nothing happened
    /// within `timeout`.
    #[instrument(skip(self), fields(server_addr = %self.server_addr))]
    pub fn fetch_events_timeout(&mut self, timeout: Option<Duration>) -> Result<Vec<ClientEvent>, Error> {
        if self.state == ClientState::Closed {
            return Ok(vec![ClientEvent::Inactive]);
        }

        let ready = self.multiplexer.wait_timeout(timeout)?;
        let mut client_events = Vec::new();

        for event in ready {
            match (event.readiness, self.state) {
                (Readiness::Connectable, ClientState::Connecting) => {
                    self.on_connectable(&mut client_events)?
                }
                (Readiness::Readable, ClientState::Exchanging) => {
                    self.on_readable(&mut client_events)
                }
                (Readiness::Woken, _) => self.flush_outbound(&mut client_events),
                (readiness, state) => trace!(?readiness, ?state, "Skipping event"),
            }

            if self.state == ClientState::Closed {
                break;
            }
        }

        Ok(client_events)
    }
}

// ============================================================================
// Internal Event Handling
// ============================================================================

impl RelayClient {
    fn on_connectable(&mut self, out: &mut Vec<ClientEvent>) -> Result<(), Error> {
        let server_addr = self.server_addr;

        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => {
                warn!(%server_addr, ?err, "Connection establishment failed");
                self.close(CloseReason::ConnectionFailed, out);
                return Ok(());
            }
        }

        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotConnected => {
                trace!(%server_addr, "Connect still in progress");
                return Ok(());
            }
            Err(err) => {
                warn!(%server_addr, ?err, "Connection establishment failed");
                self.close(CloseReason::ConnectionFailed, out);
                return Ok(());
            }
        }

        self.state = ClientState::Connected;
        info!(%server_addr, "Connection established");
        out.push(ClientEvent::Connected);

        if let Err(err) = self.stream.set_nodelay(true) {
            debug!(?err, "Failed to set TCP_NODELAY");
        }
        if let Some(input) = self.input.take() {
            spawn_input_producer(input, self.get_client_interface());
        }

        self.multiplexer
            .register(&mut self.stream, SERVER_TOKEN, InterestKind::Readable)?;
        self.state = ClientState::Exchanging;

        // Lines queued before the connection was up
        self.flush_outbound(out);
        Ok(())
    }

    fn on_readable(&mut self, out: &mut Vec<ClientEvent>) {
        loop {
            let status = read_chunk(&mut self.stream, &mut self.read_buf, self.settings.max_read_size);
            if !self.read_buf.is_empty() {
                let text = decode(&self.read_buf);
                debug!(len = text.len(), "Received message");
                out.push(ClientEvent::Message(text));
            }

            match status {
                ReadStatus::Full => continue,
                ReadStatus::Drained => return,
                ReadStatus::Closed => {
                    info!(server_addr = %self.server_addr, "Server closed the connection");
                    self.close(CloseReason::ServerClosed, out);
                    return;
                }
                ReadStatus::Failed(err) => {
                    warn!(server_addr = %self.server_addr, ?err, "Error reading from socket");
                    self.close(CloseReason::ServerClosed, out);
                    return;
                }
            }
        }
    }

    fn flush_outbound(&mut self, out: &mut Vec<ClientEvent>) {
        if self.state != ClientState::Exchanging {
            return;
        }
        let Some(receiver) = &self.receiver else {
            return;
        };
        let lines: Vec<String> = receiver.try_iter().collect();

        for line in lines {
            if line.is_empty() {
                continue;
            }

            if let Err(err) = write_fully(&mut self.stream, line.as_bytes(), self.settings.write_timeout) {
                warn!(server_addr = %self.server_addr, ?err, "Error writing to socket");
                self.close(CloseReason::SendFailed, out);
                return;
            }
            debug!(len = line.len(), "Sent line");

            if is_quit(&line) {
                self.close(CloseReason::Quit, out);
                return;
            }
        }
    }

    fn close(&mut self, reason: CloseReason, out: &mut Vec<ClientEvent>) {
        if self.state == ClientState::Closed {
            return;
        }

        // The socket stays open until the client is dropped
        self.multiplexer.cancel(&mut self.stream, SERVER_TOKEN);
        // Dropping the receiver makes further ClientInterface::send calls fail
        self.receiver = None;
        self.state = ClientState::Closed;

        info!(server_addr = %self.server_addr, ?reason, "Client closed");
        out.push(ClientEvent::Closed(reason));
    }
}

// ============================================================================
// Input Producer
// ============================================================================

/// Spawns a thread that forwards every line of `input` to `client`.
///
/// The thread stops after forwarding the quit keyword, at end of input, or
/// once the client has closed.
///
/// Lines are not written to the socket from this thread. They are queued on
/// the client's channel and written by its event loop after the wake-up.
pub fn spawn_input_producer<R>(input: R, client: ClientInterface) -> JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        for line in input.lines() {
            match line {
                Ok(text) => {
                    let quit = is_quit(&text);
                    if let Err(err) = client.send(text) {
                        debug!(?err, "Client gone, stopping input");
                        break;
                    }
                    if quit {
                        break;
                    }
                }
                Err(err) => {
                    warn!(?err, "Failed to read input");
                    break;
                }
            }
        }
        debug!("Input producer finished");
    })
}
