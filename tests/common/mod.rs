#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use locveil::{
    dedup::ResolverEvent,
    error::{BindError, TransportError},
    message::MapEntry,
    redirect::{ClientEvent, EntranceEvent, ServerEvent},
    reply::ReplyEvent,
    verifier::VerifierEvent,
    AddressPool, Duration, Prefix, Reporter, Timestamp, Transport,
};
use tracing_subscriber::{fmt, EnvFilter};

pub fn enable_tracing() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn pool(raw: &[&str]) -> AddressPool {
    raw.iter().map(|addr| addr.parse().unwrap()).collect()
}

/// The mapping database of the privacy site: one /16 of service EIDs.
pub fn table() -> Vec<MapEntry> {
    vec![MapEntry {
        prefix: Prefix::new("172.16.0.0".parse().unwrap(), 16),
        locators: vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        ],
        version: 1,
    }]
}

/// Every timer a test node may schedule, on one shared clock.
#[derive(Debug)]
pub enum Event {
    Entrance(EntranceEvent<u32>),
    Client(ClientEvent),
    Server(ServerEvent),
    Reply(ReplyEvent),
    Verifier(VerifierEvent<Bytes>),
    Resolver(ResolverEvent),
}

impl From<EntranceEvent<u32>> for Event {
    fn from(event: EntranceEvent<u32>) -> Self {
        Event::Entrance(event)
    }
}

impl From<ClientEvent> for Event {
    fn from(event: ClientEvent) -> Self {
        Event::Client(event)
    }
}

impl From<ServerEvent> for Event {
    fn from(event: ServerEvent) -> Self {
        Event::Server(event)
    }
}

impl From<ReplyEvent> for Event {
    fn from(event: ReplyEvent) -> Self {
        Event::Reply(event)
    }
}

impl From<VerifierEvent<Bytes>> for Event {
    fn from(event: VerifierEvent<Bytes>) -> Self {
        Event::Verifier(event)
    }
}

impl From<ResolverEvent> for Event {
    fn from(event: ResolverEvent) -> Self {
        Event::Resolver(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct Socket {
    local: SocketAddr,
    remote: Option<SocketAddr>,
}

/// An in-memory carrier: sockets are table entries, sends land in an outbox the test routes.
#[derive(Debug, Default)]
pub struct MemoryNet {
    next: u32,
    sockets: HashMap<u32, Socket>,
    outbox: Vec<Datagram>,
    pub refuse: HashSet<SocketAddr>,
}

impl MemoryNet {
    /// Creates the socket of an inbound connection on `local` from `peer`.
    pub fn accept(&mut self, local: SocketAddr, peer: SocketAddr) -> u32 {
        self.next += 1;
        self.sockets.insert(
            self.next,
            Socket {
                local,
                remote: Some(peer),
            },
        );

        self.next
    }

    /// Takes every datagram sent so far.
    pub fn drain(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.outbox)
    }

    pub fn is_open(&self, handle: u32) -> bool {
        self.sockets.contains_key(&handle)
    }

    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }
}

impl Transport for MemoryNet {
    type Handle = u32;

    fn bind(&mut self, local: SocketAddr) -> Result<u32, BindError> {
        let in_use = self
            .sockets
            .values()
            .any(|socket| socket.local == local && socket.remote.is_none());

        if in_use || self.refuse.contains(&local) {
            return Err(BindError {
                addr: local,
                reason: "address in use".to_string(),
            });
        }

        self.next += 1;
        self.sockets.insert(
            self.next,
            Socket {
                local,
                remote: None,
            },
        );

        Ok(self.next)
    }

    fn connect(&mut self, handle: u32, remote: SocketAddr) -> Result<(), TransportError> {
        let socket = self
            .sockets
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle)?;
        socket.remote = Some(remote);

        Ok(())
    }

    fn send(&mut self, handle: u32, bytes: Bytes) -> Result<(), TransportError> {
        let socket = self
            .sockets
            .get(&handle)
            .ok_or(TransportError::UnknownHandle)?;
        let to = socket
            .remote
            .ok_or_else(|| TransportError::SendFailed("not connected".to_string()))?;

        self.outbox.push(Datagram {
            from: socket.local,
            to,
            bytes,
        });

        Ok(())
    }

    fn close(&mut self, handle: u32) {
        self.sockets.remove(&handle);
    }
}

/// Keeps every measurement it is handed.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub established: Vec<(usize, Timestamp)>,
    pub mapping_delays: Vec<(Prefix, Duration)>,
    pub received: HashMap<SocketAddr, usize>,
}

impl Reporter for RecordingReporter {
    fn connection_established(&mut self, conn: usize, at: Timestamp) {
        self.established.push((conn, at));
    }

    fn mapping_delay(&mut self, prefix: Prefix, delay: Duration) {
        self.mapping_delays.push((prefix, delay));
    }

    fn received(&mut self, from: SocketAddr, bytes: usize) {
        *self.received.entry(from).or_default() += bytes;
    }
}

/// Hosts of a /24, for tests that need many distinct clients.
pub fn hosts(subnet: [u8; 3], count: u8) -> impl Iterator<Item = IpAddr> {
    (1..=count).map(move |host| IpAddr::from([subnet[0], subnet[1], subnet[2], host]))
}
