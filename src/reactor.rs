//! Event-loop integration.
//!
//! A [`Reactor`] owns the `mio::Poll` that engines register with through
//! [`SocketEngine::attach_notifier`](crate::socket::SocketEngine::attach_notifier).
//! Each call to [`Reactor::poll`] turns mio readiness into [`SocketEvent`]s
//! that the owner dispatches synchronously, e.g. to
//! [`TlsSession::handle_event`](crate::tls::TlsSession::handle_event).

use crate::config::{get_namespaced_usize, optional};
use crate::error::Error;
use crate::socket::SocketEvent;
use ::config::Config;

use mio::{Events, Poll, Registry, Token};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{instrument, trace};

const DEFAULT_POLL_CAPACITY: usize = 256;

pub struct Reactor {
    poll: Poll,
    poll_capacity: usize,
}

// ============================================================================
// Constructors
// ============================================================================

impl Reactor {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a reactor reading `poll_capacity` under the `name.` namespace.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let poll_capacity = optional(get_namespaced_usize(config, name, "poll_capacity"))?
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_POLL_CAPACITY);
        Self::with_capacity(poll_capacity)
    }

    pub fn with_capacity(poll_capacity: usize) -> Result<Self, Error> {
        Ok(Self {
            poll: Poll::new()?,
            poll_capacity,
        })
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl Reactor {
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Waits up to `timeout` for readiness and returns one entry per
    /// readiness kind observed.
    ///
    /// An interrupted wait returns an empty list.
    #[instrument(skip(self))]
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(Token, SocketEvent)>, Error> {
        let mut poll_events = Events::with_capacity(self.poll_capacity);
        match self.poll.poll(&mut poll_events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(Error::PollError(err.to_string())),
        }

        let mut dispatch = Vec::new();
        for event in poll_events.iter() {
            let token = event.token();
            // Errors are reported as readiness so the next read or write
            // surfaces the specific failure
            if event.is_readable() || event.is_error() {
                dispatch.push((token, SocketEvent::Readable));
            }
            if event.is_writable() {
                dispatch.push((token, SocketEvent::Writable));
            }
            if event.is_read_closed() && event.is_write_closed() {
                dispatch.push((token, SocketEvent::Closed));
            }
        }

        trace!(count = dispatch.len(), "Polled readiness");
        Ok(dispatch)
    }
}
