//! Routing of readiness events to the server's handlers.

use crate::multiplexer::{Readiness, ReadinessEvent};
use crate::registry::{ConnectionId, ConnectionRegistry};
use mio::Token;

/// What the server should do with one readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Accept,
    Relay(ConnectionId),
    Wake,
    Skip,
}

/// Maps a readiness event to a handler.
///
/// Events for connections that are no longer registered are skipped. That
/// happens routinely when an earlier event of the same batch disconnected
/// the connection.
pub(crate) fn route(event: &ReadinessEvent, listener: Token, registry: &ConnectionRegistry) -> Route {
    match event.readiness {
        Readiness::Woken => Route::Wake,
        Readiness::Acceptable if event.token == listener => Route::Accept,
        Readiness::Readable if event.token != listener => {
            let id = ConnectionId::from(event.token);
            if registry.contains(id) {
                Route::Relay(id)
            } else {
                Route::Skip
            }
        }
        _ => Route::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTENER: Token = Token(0);

    fn event(token: usize, readiness: Readiness) -> ReadinessEvent {
        ReadinessEvent {
            token: Token(token),
            readiness,
        }
    }

    #[test]
    fn listener_accept_is_routed() {
        let registry = ConnectionRegistry::new();
        assert_eq!(route(&event(0, Readiness::Acceptable), LISTENER, &registry), Route::Accept);
    }

    #[test]
    fn wake_is_routed() {
        let registry = ConnectionRegistry::new();
        assert_eq!(route(&event(1, Readiness::Woken), LISTENER, &registry), Route::Wake);
    }

    #[test]
    fn stale_readable_is_skipped() {
        let registry = ConnectionRegistry::new();
        assert_eq!(route(&event(1000, Readiness::Readable), LISTENER, &registry), Route::Skip);
    }

    #[test]
    fn unhandled_interest_is_skipped() {
        let registry = ConnectionRegistry::new();
        assert_eq!(route(&event(0, Readiness::Readable), LISTENER, &registry), Route::Skip);
        assert_eq!(route(&event(1000, Readiness::Writable), LISTENER, &registry), Route::Skip);
        assert_eq!(route(&event(1000, Readiness::Acceptable), LISTENER, &registry), Route::Skip);
    }
}
