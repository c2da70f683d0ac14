//! Connection registry.
//!
//! The authoritative set of live client connections. The reactor thread is
//! its main user, but a [`RelayHandle`](crate::RelayHandle) can inspect it
//! from other threads, so the map sits behind one lock.

use crate::codec::sender_label;
use mio::net::TcpStream;
use mio::Token;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifier of a client connection. Doubles as its multiplexer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for ConnectionId {
    fn from(token: Token) -> Self {
        ConnectionId(token.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Socket and read buffer of a connection, guarded by the connection's own
/// lock.
#[derive(Debug)]
pub(crate) struct ConnectionIo {
    pub(crate) stream: TcpStream,
    pub(crate) read_buf: Vec<u8>,
}

/// A live client connection.
#[derive(Debug)]
pub struct Connection {
    io: Mutex<ConnectionIo>,
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        read_capacity: usize,
    ) -> Self {
        Self {
            io: Mutex::new(ConnectionIo {
                stream,
                read_buf: Vec::with_capacity(read_capacity),
            }),
            id,
            local_addr,
            peer_addr,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The server-side address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The label other clients see in front of this client's messages.
    pub fn label(&self) -> String {
        sender_label(&self.peer_addr)
    }

    pub(crate) fn io(&self) -> MutexGuard<'_, ConnectionIo> {
        self.io.lock()
    }
}

/// Shared, lock-guarded map from [`ConnectionId`] to [`Connection`].
///
/// Cloning yields another handle to the same map. Iteration order is the
/// ascending id order. The map lock is only held for lookups; socket I/O
/// runs under the lock of the connection itself, so a slow socket never
/// blocks other users of the registry.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<BTreeMap<ConnectionId, Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a connection. A connection with the same id is replaced and
    /// returned, which only happens if ids were handed out twice.
    pub(crate) fn insert(&self, connection: Connection) -> Option<Arc<Connection>> {
        let id = connection.id();
        let old = self.connections.lock().insert(id, Arc::new(connection));
        if old.is_some() {
            warn!(%id, "Replaced connection with duplicate id");
        }
        old
    }

    /// Removes a connection and hands it back to the caller.
    ///
    /// Returns `None` for ids that are not registered.
    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.lock().remove(&id);
        if removed.is_none() {
            debug!(%id, "Connection already removed");
        }
        removed
    }

    /// The connection with the given id, if it is registered.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    /// Runs `f` on the socket of the connection with the given id.
    ///
    /// Only the connection's own lock is held while `f` runs.
    pub(crate) fn with_connection<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionIo) -> R,
    ) -> Option<R> {
        let connection = self.get(id)?;
        let mut io = connection.io();
        Some(f(&mut *io))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Copy of the current ids, safe to iterate while the registry changes.
    pub fn snapshot_ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }

    /// Copy of the current ids together with their peer addresses.
    pub fn snapshot(&self) -> Vec<(ConnectionId, SocketAddr)> {
        self.connections
            .lock()
            .values()
            .map(|conn| (conn.id(), conn.peer_addr()))
            .collect()
    }

    /// Looks up a connection by the client's address, as seen by the server.
    pub fn find_by_peer(&self, peer_addr: SocketAddr) -> Option<ConnectionId> {
        self.connections
            .lock()
            .values()
            .find(|conn| conn.peer_addr() == peer_addr)
            .map(|conn| conn.id())
    }

    pub fn label_of(&self, id: ConnectionId) -> Option<String> {
        self.get(id).map(|conn| conn.label())
    }

    /// Shuts down the socket of a connection without removing it. The
    /// reactor sees end-of-stream on its next wait and removes it then.
    pub fn shutdown(&self, id: ConnectionId, how: Shutdown) {
        let Some(conn) = self.get(id) else {
            debug!(%id, "Connection not found when shutting down connection");
            return;
        };
        let peer_addr = conn.peer_addr();
        match conn.io().stream.shutdown(how) {
            Ok(()) => debug!(%id, ?how, %peer_addr, "Shut down connection"),
            Err(err) => debug!(%id, ?how, %peer_addr, ?err, "Error shutting down connection"),
        };
    }
}
