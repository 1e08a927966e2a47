//! Seams to the collaborators the engine runs against: a clock with timers, a carrier
//! transport, the local mapping database and a result sink.

use std::{fmt, hash::Hash, net::IpAddr, net::SocketAddr};

use bytes::Bytes;
use time::Duration;

use crate::{
    core::{clock::Timestamp, identity::Prefix, message::MapEntry},
    error::{BindError, TransportError},
};

/// Identifies a scheduled event so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub(crate) u64);

impl EventId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// "Run this later": the only way the engine suspends work.
///
/// Events are owned values. Implementations must drop an event exactly once: after handing it
/// back to the owner when it fires, or straight away when it is cancelled. Waiting tickets
/// carried inside events rely on this to keep their counters balanced.
pub trait Scheduler<E> {
    /// The current logical time.
    fn now(&self) -> Timestamp;

    /// Schedules `event` to fire after `delay`; negative delays fire immediately.
    fn schedule(&mut self, delay: Duration, event: E) -> EventId;

    /// Cancels a pending event, returns `false` if it already fired or never existed.
    fn cancel(&mut self, id: EventId) -> bool;
}

/// The carrier network layer, reduced to what the redirection roles need.
///
/// A bind failure is fatal to the caller; every other error is logged and absorbed.
pub trait Transport {
    type Handle: Copy + Eq + Hash + fmt::Debug;

    /// Creates a socket bound to `local`.
    fn bind(&mut self, local: SocketAddr) -> Result<Self::Handle, BindError>;

    /// Connects a bound socket to `remote`.
    fn connect(&mut self, handle: Self::Handle, remote: SocketAddr) -> Result<(), TransportError>;

    /// Sends on a connected socket.
    fn send(&mut self, handle: Self::Handle, bytes: Bytes) -> Result<(), TransportError>;

    /// Sends a datagram to `to`; the provided implementation connects then sends.
    fn send_to(
        &mut self,
        handle: Self::Handle,
        to: SocketAddr,
        bytes: Bytes,
    ) -> Result<(), TransportError> {
        self.connect(handle, to)?;
        self.send(handle, bytes)
    }

    /// Closes the socket; closing an unknown handle is a no-op.
    fn close(&mut self, handle: Self::Handle);
}

/// The local mapping database (EID prefix to locators).
pub trait MappingDatabase {
    /// Returns the entry covering `eid`, if one is registered.
    fn lookup(&self, eid: IpAddr) -> Option<MapEntry>;
}

/// Longest-prefix match over a list of entries.
impl MappingDatabase for [MapEntry] {
    fn lookup(&self, eid: IpAddr) -> Option<MapEntry> {
        self.iter()
            .filter(|entry| entry.prefix.contains(eid))
            .max_by_key(|entry| entry.prefix.prefix_len())
            .cloned()
    }
}

impl MappingDatabase for Vec<MapEntry> {
    fn lookup(&self, eid: IpAddr) -> Option<MapEntry> {
        self.as_slice().lookup(eid)
    }
}

/// A sink for measurements; the provided implementations discard them.
pub trait Reporter {
    /// A server considers connection number `conn` established.
    fn connection_established(&mut self, _conn: usize, _at: Timestamp) {}

    /// A map reply for `prefix` arrived `delay` after the request left.
    fn mapping_delay(&mut self, _prefix: Prefix, _delay: Duration) {}

    /// A server received `bytes` bytes from `from`.
    fn received(&mut self, _from: SocketAddr, _bytes: usize) {}
}

impl Reporter for () {}
