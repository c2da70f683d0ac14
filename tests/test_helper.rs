//! Shared helpers for the integration tests.
//!
//! Use TEST_LOG to see tracing output (1: info, 2: debug, 3: trace):
//!
//! ```bash
//! TEST_LOG=2 cargo test relay -- --nocapture
//! ```
#![allow(dead_code)]

use config::Config;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use textrelay::prelude::*;

static INIT: Once = Once::new();

pub const DEADLINE: Duration = Duration::from_secs(5);

/// Initialize tracing based on the TEST_LOG environment variable
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("textrelay={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Server Helpers
// ============================================================================

pub fn bind_server(config: &Config) -> RelayServer {
    init_tracing();
    RelayServer::bind(config, "127.0.0.1:0").expect("Failed to bind relay server")
}

/// Turns the reactor until `done` holds for the events collected so far.
pub fn pump_until<F>(server: &mut RelayServer, mut done: F) -> Vec<ServerEvent>
where
    F: FnMut(&RelayServer, &[ServerEvent]) -> bool,
{
    let start = Instant::now();
    let mut collected = Vec::new();
    while !done(server, &collected) {
        assert!(start.elapsed() < DEADLINE, "Timed out, events so far: {collected:?}");
        let events = server
            .turn_timeout(Some(Duration::from_millis(20)))
            .expect("Reactor failed");
        collected.extend(events);
    }
    collected
}

/// Connects `count` blocking clients and turns the reactor until all of
/// them are registered. Returns the clients with their server-side ids.
pub fn connect_clients(server: &mut RelayServer, count: usize) -> Vec<(TcpStream, ConnectionId)> {
    let expected = server.registry().len() + count;
    let streams: Vec<TcpStream> = (0..count).map(|_| connect(server.local_addr())).collect();
    pump_until(server, |server, _| server.registry().len() == expected);

    streams
        .into_iter()
        .map(|stream| {
            let local_addr = stream.local_addr().expect("Failed to get local address");
            let id = server
                .registry()
                .find_by_peer(local_addr)
                .expect("Client not registered");
            (stream, id)
        })
        .collect()
}

/// Starts a server on a background thread.
pub fn spawn_server(config: &Config) -> (SocketAddr, RelayHandle, JoinHandle<Result<(), Error>>) {
    let mut server = bind_server(config);
    let addr = server.local_addr();
    let handle = server.get_relay_handle();
    let join = thread::spawn(move || server.run());
    (addr, handle, join)
}

// ============================================================================
// Client Helpers
// ============================================================================

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("Failed to connect");
    stream
        .set_read_timeout(Some(DEADLINE))
        .expect("Failed to set read timeout");
    stream
}

/// The text a client sees when the client at `sender` sends `text`.
pub fn relayed(sender: &TcpStream, text: &str) -> String {
    let port = sender.local_addr().expect("Failed to get local address").port();
    format!("Client [{port}]: {text}")
}

/// Reads exactly `expected.len()` bytes and returns them as text.
pub fn read_text(stream: &mut TcpStream, expected: &str) -> String {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).expect("Failed to read relayed text");
    String::from_utf8(buf).expect("Relayed text is not UTF-8")
}

/// Asserts that nothing arrives on `stream` for a short while.
pub fn assert_silent(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("Failed to set read timeout");
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
        other => panic!("Expected no data, got {other:?}"),
    }
    stream
        .set_read_timeout(Some(DEADLINE))
        .expect("Failed to set read timeout");
}

/// Asserts that the server closed `stream`.
pub fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Err(err) if err.kind() == ErrorKind::ConnectionReset => {}
        other => panic!("Expected end-of-stream, got {other:?}"),
    }
}

/// Polls `condition` until it holds or the deadline passes.
pub fn wait_for(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < DEADLINE, "Timed out waiting for condition");
        thread::sleep(Duration::from_millis(10));
    }
}
