//! The redirection roles: entrance, client and server.
//!
//! A client first contacts the public entrance. The entrance answers with a redirect message
//! carrying the server address selected for the client's identity, the client reconnects there
//! from a fresh port, and the server (optionally) checks that the client reached the address
//! it was meant to reach.
//!
//! The controllers are passive state machines: they never own the transport or the clock. Every
//! entry point takes the collaborators it needs, and timers come back through `on_event`.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::{
    config::RedirectConfig,
    core::{
        clock::{Duration, Timestamp},
        cost::DelaySampler,
        message::RedirectMessage,
        pool::AddressPool,
        traits::{EventId, Reporter, Scheduler, Transport},
        waiting::{WaitingCounter, WaitingGuard},
    },
    error::{BindError, ConfigError, Error, TransportError},
    selector::AddressSelector,
};

/// Timers of the entrance role.
#[derive(Debug)]
pub enum EntranceEvent<H> {
    /// Send the redirect to `peer` on the accepted connection `handle`.
    SendRedirect {
        handle: H,
        peer: SocketAddr,
        target: IpAddr,
        ticket: WaitingGuard,
    },
}

/// The public entrance: redirects every first contact to the server address selected for it.
#[derive(Debug)]
pub struct EntranceController<H> {
    // Interface addresses of the real server, the entrance never redirects to itself.
    server_pool: AddressPool,
    selector: AddressSelector,
    sampler: DelaySampler,
    // Clients whose redirect hasn't been sent yet.
    waiting: WaitingCounter,
    listener: Option<H>,
}

impl<H: Copy> EntranceController<H> {
    pub fn new(config: &RedirectConfig, server_pool: AddressPool) -> Result<Self, ConfigError> {
        config.validate()?;
        server_pool.ensure_non_empty("server")?;

        Ok(Self {
            server_pool,
            selector: AddressSelector::new(config.identity_prefix_len),
            sampler: DelaySampler::new(config.hash_cost, config.seed),
            waiting: WaitingCounter::new(),
            listener: None,
        })
    }

    /// Binds the entrance's public socket.
    pub fn start<T>(&mut self, transport: &mut T, local: SocketAddr) -> Result<H, BindError>
    where
        T: Transport<Handle = H>,
    {
        let handle = transport.bind(local).map_err(|e| {
            error!(addr = %local, "entrance failed to bind: {e}");
            e
        })?;
        info!(addr = %local, "entrance listening");

        self.listener = Some(handle);
        Ok(handle)
    }

    /// Handles the first data a client sends on connection `handle`.
    ///
    /// The redirect leaves after the modeled hash cost times the number of clients waiting.
    pub fn on_data<E, S>(
        &mut self,
        handle: H,
        peer: SocketAddr,
        scheduler: &mut S,
    ) -> Result<EventId, Error>
    where
        E: From<EntranceEvent<H>>,
        S: Scheduler<E>,
    {
        let target = self.selector.select(peer.ip(), &self.server_pool)?;
        let ticket = self.waiting.enter();
        let delay = ticket.delay(self.sampler.sample());
        debug!(peer = %peer, target = %target, delay = ?delay, "scheduling redirect");

        Ok(scheduler.schedule(
            delay,
            EntranceEvent::SendRedirect {
                handle,
                peer,
                target,
                ticket,
            }
            .into(),
        ))
    }

    /// Handles a fired timer: sends the redirect and closes the initial connection.
    pub fn on_event<T>(&mut self, event: EntranceEvent<H>, transport: &mut T)
    where
        T: Transport<Handle = H>,
    {
        match event {
            EntranceEvent::SendRedirect {
                handle,
                peer,
                target,
                ticket,
            } => {
                let message = RedirectMessage::redirect_to(target);
                if let Err(e) = transport.send(handle, message.to_bytes()) {
                    warn!(peer = %peer, "couldn't send redirect: {e}");
                }
                transport.close(handle);
                debug!(peer = %peer, target = %target, "redirect sent");

                drop(ticket);
            }
        }
    }

    /// The number of clients waiting for their redirect.
    pub fn waiting(&self) -> usize {
        self.waiting.get()
    }

    pub fn listener(&self) -> Option<H> {
        self.listener
    }
}

/// Timers of the client role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connect the client bound to `local` to the server address it was redirected to.
    ContactServer { local: SocketAddr, target: IpAddr },
}

/// Where the client is in the redirect flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    /// Contacted the entrance, waiting for its answer.
    AwaitingRedirect,
    /// Redirected, about to contact `target`.
    Redirecting { target: IpAddr },
    /// Talking to the final peer.
    Connected { remote: SocketAddr },
}

/// A client that follows at most one redirect at a time.
#[derive(Debug)]
pub struct ClientController<H> {
    entrance: SocketAddr,
    local: SocketAddr,
    server_port: u16,
    payload: Bytes,
    recompute_delay: Duration,
    state: ClientState,
    entrance_handle: Option<H>,
    server_handle: Option<H>,
    // The contact timer, cancelled when a newer message supersedes it.
    pending: Option<EventId>,
}

impl<H: Copy> ClientController<H> {
    pub fn new(
        config: &RedirectConfig,
        local_ip: IpAddr,
        entrance: SocketAddr,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            entrance,
            local: SocketAddr::new(local_ip, config.client_port),
            server_port: config.server_port,
            payload: Bytes::from(vec![0u8; config.payload_size]),
            recompute_delay: config.recompute_delay(),
            state: ClientState::Idle,
            entrance_handle: None,
            server_handle: None,
            pending: None,
        })
    }

    /// Replaces the payload sent to the entrance and, after a redirect, to the server.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Contacts the entrance.
    pub fn start<T>(&mut self, transport: &mut T) -> Result<(), Error>
    where
        T: Transport<Handle = H>,
    {
        let handle = transport.bind(self.local)?;
        self.entrance_handle = Some(handle);
        self.state = ClientState::AwaitingRedirect;

        if let Err(e) = transport.send_to(handle, self.entrance, self.payload.clone()) {
            warn!(entrance = %self.entrance, "couldn't contact the entrance: {e}");
        }
        debug!(local = %self.local, entrance = %self.entrance, "contacted entrance");

        Ok(())
    }

    /// Handles data received from `from`.
    ///
    /// A redirect schedules a new contact after the recompute delay; anything else makes the
    /// current connection final. Either way a contact still pending is cancelled.
    pub fn on_data<E, S>(&mut self, from: SocketAddr, bytes: Bytes, scheduler: &mut S)
    where
        E: From<ClientEvent>,
        S: Scheduler<E>,
    {
        if let Some(id) = self.pending.take() {
            scheduler.cancel(id);
        }

        let redirect = RedirectMessage::decode(bytes)
            .filter(|message| message.redirect)
            .and_then(|message| message.target());

        match redirect {
            Some(target) => {
                debug!(from = %from, target = %target, "redirected");
                self.state = ClientState::Redirecting { target };
                self.pending = Some(scheduler.schedule(
                    self.recompute_delay,
                    ClientEvent::ContactServer {
                        local: self.local,
                        target,
                    }
                    .into(),
                ));
            }
            None => {
                debug!(from = %from, "connection is final");
                self.state = ClientState::Connected { remote: from };
            }
        }
    }

    /// Handles a fired timer: leaves the entrance and contacts the selected server.
    pub fn on_event<T>(&mut self, event: ClientEvent, transport: &mut T) -> Result<(), Error>
    where
        T: Transport<Handle = H>,
    {
        match event {
            ClientEvent::ContactServer { local, target } => {
                debug_assert_eq!(local, self.local);
                self.pending = None;

                if let Some(handle) = self.entrance_handle.take() {
                    transport.close(handle);
                }
                if let Some(handle) = self.server_handle.take() {
                    transport.close(handle);
                }

                let local = self.redirect_port()?;
                let handle = transport.bind(local)?;
                self.server_handle = Some(handle);

                let remote = SocketAddr::new(target, self.server_port);
                self.state = ClientState::Connected { remote };

                if let Err(e) = transport
                    .connect(handle, remote)
                    .and_then(|_| transport.send(handle, self.payload.clone()))
                {
                    warn!(server = %remote, "couldn't reach the redirected server: {e}");
                    return Ok(());
                }
                debug!(local = %local, server = %remote, "contacted server");

                Ok(())
            }
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The address the client first contacts the entrance from.
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// The socket the client reconnects from: the next port after the initial one.
    fn redirect_port(&self) -> Result<SocketAddr, BindError> {
        match self.local.port().checked_add(1) {
            Some(port) => Ok(SocketAddr::new(self.local.ip(), port)),
            None => Err(BindError {
                addr: self.local,
                reason: "no port left after the initial one".to_string(),
            }),
        }
    }
}

/// Timers of the server role.
#[derive(Debug)]
pub enum ServerEvent {
    /// Connection number `conn` is considered established.
    ConnectionEstablished { conn: usize, ticket: WaitingGuard },
}

/// The real server: listens on every pool address and optionally checks that each client
/// reached the address selected for it.
#[derive(Debug)]
pub struct ServerController<H> {
    pool: AddressPool,
    selector: AddressSelector,
    sampler: DelaySampler,
    waiting: WaitingCounter,
    port: u16,
    check_address: bool,
    // One listener per pool address.
    listeners: Vec<(H, IpAddr)>,
    // Accepted (and trusted) connections, in order.
    accepted: Vec<(H, SocketAddr)>,
    rejected: usize,
    received: usize,
}

impl<H: Copy + Eq> ServerController<H> {
    pub fn new(config: &RedirectConfig, pool: AddressPool) -> Result<Self, ConfigError> {
        config.validate()?;
        pool.ensure_non_empty("server")?;

        Ok(Self {
            pool,
            selector: AddressSelector::new(config.identity_prefix_len),
            sampler: DelaySampler::new(config.hash_cost, config.seed),
            waiting: WaitingCounter::new(),
            port: config.server_port,
            check_address: config.check_address,
            listeners: Vec::new(),
            accepted: Vec::new(),
            rejected: 0,
            received: 0,
        })
    }

    /// Binds one listener per pool address; any failure aborts the start.
    pub fn start<T>(&mut self, transport: &mut T) -> Result<(), BindError>
    where
        T: Transport<Handle = H>,
    {
        for addr in self.pool.iter() {
            let local = SocketAddr::new(*addr, self.port);
            let handle = transport.bind(local).map_err(|e| {
                error!(addr = %local, "server failed to bind: {e}");
                e
            })?;

            self.listeners.push((handle, *addr));
        }
        info!(
            listeners = self.listeners.len(),
            port = self.port,
            check_address = self.check_address,
            "server listening"
        );

        Ok(())
    }

    /// Handles a connection from `peer` accepted on `listener`.
    ///
    /// With address checking on, a peer that reached a pool address other than its own is
    /// logged and ignored; the caller keeps ownership of `conn` either way. Returns the
    /// "established" timer of a trusted connection.
    pub fn on_accept<E, S>(
        &mut self,
        listener: H,
        conn: H,
        peer: SocketAddr,
        scheduler: &mut S,
    ) -> Result<Option<EventId>, Error>
    where
        E: From<ServerEvent>,
        S: Scheduler<E>,
    {
        let local = self
            .listeners
            .iter()
            .find(|(handle, _)| *handle == listener)
            .map(|(_, addr)| *addr)
            .ok_or(TransportError::UnknownHandle)?;

        if self.check_address {
            let expected = self.selector.select(peer.ip(), &self.pool)?;
            if expected != local {
                warn!(
                    peer = %peer,
                    expected = %expected,
                    actual = %local,
                    "peer reached the wrong address"
                );
                self.rejected += 1;
                return Ok(None);
            }
        }

        self.accepted.push((conn, peer));
        let ticket = self.waiting.enter();
        let delay = if self.check_address {
            ticket.delay(self.sampler.sample())
        } else {
            Duration::ZERO
        };
        debug!(peer = %peer, local = %local, delay = ?delay, "accepted connection");

        Ok(Some(scheduler.schedule(
            delay,
            ServerEvent::ConnectionEstablished {
                conn: self.accepted.len(),
                ticket,
            }
            .into(),
        )))
    }

    /// Accounts for data received from `from`.
    pub fn on_read<R: Reporter>(&mut self, from: SocketAddr, bytes: &[u8], reporter: &mut R) {
        self.received += bytes.len();
        reporter.received(from, bytes.len());
    }

    /// Handles a fired timer.
    pub fn on_event<R: Reporter>(&mut self, event: ServerEvent, now: Timestamp, reporter: &mut R) {
        match event {
            ServerEvent::ConnectionEstablished { conn, ticket } => {
                drop(ticket);
                reporter.connection_established(conn, now);
            }
        }
    }

    /// The pool address each listener is bound to.
    pub fn listeners(&self) -> &[(H, IpAddr)] {
        &self.listeners
    }

    pub fn accepted(&self) -> &[(H, SocketAddr)] {
        &self.accepted
    }

    /// The number of connections that failed the address check.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Total payload bytes received.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn waiting(&self) -> usize {
        self.waiting.get()
    }
}
