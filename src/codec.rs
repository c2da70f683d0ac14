//! Text helpers for the relay protocol.
//!
//! The protocol has no framing: whatever bytes one readiness wake-up drains
//! from a socket are decoded as one unit. A unit can hold part of a line or
//! several lines, and nothing here tries to repair that.

use std::net::SocketAddr;

/// The text that makes the side observing it close the connection.
pub const QUIT: &str = "quit";

/// Decodes one drained buffer as UTF-8.
///
/// Invalid sequences, including a multi-byte character cut in half by a
/// buffer boundary, are replaced with U+FFFD.
pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Returns true if the decoded unit is exactly the quit keyword.
pub fn is_quit(text: &str) -> bool {
    text == QUIT
}

/// Human-readable label of a client, derived from its remote port.
pub fn sender_label(peer_addr: &SocketAddr) -> String {
    format!("Client [{}]", peer_addr.port())
}

/// Builds the bytes written to every recipient of a broadcast.
pub fn broadcast_payload(label: &str, text: &str) -> Vec<u8> {
    format!("{label}: {text}").into_bytes()
}
