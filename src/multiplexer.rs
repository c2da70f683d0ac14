//! Readiness multiplexer.
//!
//! Thin layer over [`mio::Poll`] that remembers what each token was
//! registered for, so raw readiness can be reported as the interest that
//! fired (accept, read, write or connect). Tokens that were cancelled are
//! forgotten immediately and their leftover readiness is never reported.

use crate::error::Error;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// The interest a source is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterestKind {
    /// A listener with pending inbound connections.
    Acceptable,
    /// A stream with bytes to read, or a closed/failed stream.
    Readable,
    /// A stream with room in its send buffer.
    Writable,
    /// A stream whose non-blocking connect has completed or failed.
    Connectable,
}

impl InterestKind {
    fn as_mio(self) -> Interest {
        match self {
            InterestKind::Acceptable | InterestKind::Readable => Interest::READABLE,
            InterestKind::Writable | InterestKind::Connectable => Interest::WRITABLE,
        }
    }
}

/// What fired for a token during one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Acceptable,
    Readable,
    Writable,
    Connectable,
    /// The multiplexer was woken through its [`Waker`].
    Woken,
}

/// A readiness notification produced by [`Multiplexer::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub token: Token,
    pub readiness: Readiness,
}

/// Single-threaded readiness multiplexer.
#[derive(Debug)]
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    interests: HashMap<Token, InterestKind>,
    waker: Arc<Waker>,
    wake_token: Token,
}

impl Multiplexer {
    /// Creates a multiplexer with a waker registered under `wake_token`.
    pub fn new(capacity: usize, wake_token: Token) -> Result<Self, Error> {
        let poll = Poll::new().map_err(Error::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), wake_token).map_err(Error::Poll)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            interests: HashMap::new(),
            waker,
            wake_token,
        })
    }

    /// Adds `source` under `token`, or updates its interest if the token is
    /// already registered.
    pub fn register<S>(&mut self, source: &mut S, token: Token, kind: InterestKind) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        let registry = self.poll.registry();
        let result = match self.interests.insert(token, kind) {
            Some(old) if old == kind => return Ok(()),
            Some(_) => registry.reregister(source, token, kind.as_mio()),
            None => registry.register(source, token, kind.as_mio()),
        };
        if let Err(err) = result {
            self.interests.remove(&token);
            return Err(Error::Io(err));
        }

        trace!(token = token.0, ?kind, "Registered interest");
        Ok(())
    }

    /// Removes `source` from future waits.
    ///
    /// Unknown tokens are ignored, so cancelling twice is harmless.
    pub fn cancel<S>(&mut self, source: &mut S, token: Token)
    where
        S: Source + ?Sized,
    {
        if self.interests.remove(&token).is_none() {
            return;
        }
        // The socket is dropped right after this anyway, which also removes
        // it from the poll set.
        if let Err(err) = self.poll.registry().deregister(source) {
            debug!(token = token.0, ?err, "Deregister failed");
        }
        trace!(token = token.0, "Cancelled interest");
    }

    /// Returns true if `token` is currently registered.
    pub fn is_registered(&self, token: Token) -> bool {
        self.interests.contains_key(&token)
    }

    /// Handle that makes a blocked [`Self::wait`] return a
    /// [`Readiness::Woken`] event. Can be used from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Blocks until at least one registered interest is ready and returns
    /// every ready event.
    pub fn wait(&mut self) -> Result<Vec<ReadinessEvent>, Error> {
        loop {
            let ready = self.wait_timeout(None)?;
            if !ready.is_empty() {
                return Ok(ready);
            }
        }
    }

    /// Like [`Self::wait`], but gives up after `timeout` and then returns an
    /// empty batch.
    pub fn wait_timeout(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadinessEvent>, Error> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(Error::Poll(err)),
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            let token = event.token();

            if token == self.wake_token {
                ready.push(ReadinessEvent {
                    token,
                    readiness: Readiness::Woken,
                });
                continue;
            }

            let Some(kind) = self.interests.get(&token) else {
                trace!(token = token.0, "Dropping readiness for cancelled token");
                continue;
            };

            // Errors and hang-ups are reported as the registered interest so
            // that the following accept, read or connect check surfaces the
            // actual failure.
            let failed = event.is_error() || event.is_read_closed() || event.is_write_closed();
            let readiness = match kind {
                InterestKind::Acceptable if event.is_readable() || failed => Readiness::Acceptable,
                InterestKind::Readable if event.is_readable() || failed => Readiness::Readable,
                InterestKind::Writable if event.is_writable() || failed => Readiness::Writable,
                InterestKind::Connectable if event.is_writable() || failed => Readiness::Connectable,
                _ => continue,
            };
            ready.push(ReadinessEvent { token, readiness });
        }

        trace!(count = ready.len(), "Readiness events");
        Ok(ready)
    }
}
