//! Map reply generation for privacy-enabled sites.
//!
//! Depending on the configured [`ReplyMode`], a map request is answered with the real locator
//! set, with the single locator selected for the requester, or with the real set plus a
//! data-plane redirect sent to the requester on the side. Everything leaves through the
//! scheduler so the modeled hashing cost shows up as a send delay.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
};

use tracing::{debug, info};

use crate::{
    config::{PrivacyConfig, RedirectConfig, ReplyMode},
    core::{
        clock::{Duration, Timestamp},
        cost::DelaySampler,
        identity::{PeerIdentity, Prefix},
        message::{MapReply, MapRequest, RedirectMessage},
        pool::SitePools,
        traits::{EventId, MappingDatabase, Reporter, Scheduler},
        waiting::{WaitingCounter, WaitingGuard},
    },
    error::{ConfigError, SelectError},
    selector::AddressSelector,
};

/// Timers of the reply generator.
#[derive(Debug)]
pub enum ReplyEvent {
    /// Send `reply` to the requesting tunnel router.
    SendReply {
        to: IpAddr,
        reply: MapReply,
        ticket: Option<WaitingGuard>,
    },
    /// Send a redirect packet to the host behind `requester`.
    FastRedirect {
        requester: IpAddr,
        ticket: WaitingGuard,
    },
}

/// What the generator asks its caller to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A map reply for the tunnel router at `to`.
    Reply { to: IpAddr, reply: MapReply },
    /// A redirect data packet, sent from `source_port` to `to`.
    Redirect {
        source_port: u16,
        to: SocketAddr,
        message: RedirectMessage,
    },
}

/// Answers map requests for the local site according to its privacy mode.
#[derive(Debug)]
pub struct PrivacyMapReplyGenerator {
    mode: ReplyMode,
    selector: AddressSelector,
    pools: SitePools,
    sampler: DelaySampler,
    // Replies and redirects waiting for their modeled hash.
    waiting: WaitingCounter,
    // Requesters that already paid for their redirect locator.
    privacy_done: HashSet<PeerIdentity>,
    server_port: u16,
    client_port: u16,
}

impl PrivacyMapReplyGenerator {
    /// Creates a generator; the mode's pool must be populated.
    pub fn new(
        config: &PrivacyConfig,
        redirect: &RedirectConfig,
        pools: SitePools,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        redirect.validate()?;

        let mode = config.reply_mode();
        match mode {
            ReplyMode::Plain => (),
            ReplyMode::RlocRedirect => pools.rlocs.ensure_non_empty("rloc")?,
            ReplyMode::FastRedirect => pools.services.ensure_non_empty("service")?,
        }
        info!(mode = ?mode, "map reply generator ready");

        Ok(Self {
            mode,
            selector: AddressSelector::masked(config.identity_prefix_len),
            pools,
            sampler: DelaySampler::new(config.hash_cost, config.seed),
            waiting: WaitingCounter::new(),
            privacy_done: HashSet::new(),
            server_port: redirect.server_port,
            client_port: redirect.client_port,
        })
    }

    /// Answers `request` from `db`.
    ///
    /// Returns `None` if the database has no entry for the requested EID; no negative reply is
    /// synthesized. Otherwise returns the timer of the reply send.
    pub fn generate<E, S, D>(
        &mut self,
        request: &MapRequest,
        db: &D,
        scheduler: &mut S,
    ) -> Result<Option<EventId>, SelectError>
    where
        E: From<ReplyEvent>,
        S: Scheduler<E>,
        D: MappingDatabase + ?Sized,
    {
        let Some(entry) = db.lookup(request.eid) else {
            debug!(eid = %request.eid, "no mapping, not replying");
            return Ok(None);
        };

        let (locators, delay, ticket) = match self.mode {
            ReplyMode::Plain => (entry.locators.clone(), Duration::ZERO, None),
            ReplyMode::FastRedirect => {
                let ticket = self.waiting.enter();
                let delay = ticket.delay(self.sampler.sample());
                debug!(requester = %request.source_eid, delay = ?delay, "scheduling fast redirect");

                scheduler.schedule(
                    delay,
                    ReplyEvent::FastRedirect {
                        requester: request.source_eid,
                        ticket,
                    }
                    .into(),
                );

                (entry.locators.clone(), Duration::ZERO, None)
            }
            ReplyMode::RlocRedirect => {
                let identity = self.selector.identity(request.source_eid);
                let locator = self.selector.select(request.source_eid, &self.pools.rlocs)?;

                // Only the first request of a requester pays for the hash.
                let (delay, ticket) = if self.privacy_done.insert(identity) {
                    let ticket = self.waiting.enter();
                    (ticket.delay(self.sampler.sample()), Some(ticket))
                } else {
                    (Duration::ZERO, None)
                };
                debug!(
                    requester = %identity,
                    locator = %locator,
                    delay = ?delay,
                    "replying with selected locator"
                );

                (vec![locator], delay, ticket)
            }
        };

        let reply = MapReply::for_request(request, &entry, locators);
        Ok(Some(scheduler.schedule(
            delay,
            ReplyEvent::SendReply {
                to: request.itr_rloc,
                reply,
                ticket,
            }
            .into(),
        )))
    }

    /// Handles a fired timer, returning what to send.
    pub fn on_event(&mut self, event: ReplyEvent) -> Result<Outbound, SelectError> {
        match event {
            ReplyEvent::SendReply { to, reply, ticket } => {
                drop(ticket);
                Ok(Outbound::Reply { to, reply })
            }
            ReplyEvent::FastRedirect { requester, ticket } => {
                let target = self.selector.select(requester, &self.pools.services)?;
                debug!(requester = %requester, target = %target, "sending fast redirect");
                drop(ticket);

                Ok(Outbound::Redirect {
                    source_port: self.server_port,
                    to: SocketAddr::new(requester, self.client_port),
                    message: RedirectMessage::redirect_to(target),
                })
            }
        }
    }

    /// Returns `true` if the map server may answer on the site's behalf.
    ///
    /// A proxied reply carries the real locators and would skip the selection, so it is only
    /// allowed without a redirect mode.
    pub fn proxy_reply_allowed(&self) -> bool {
        self.mode == ReplyMode::Plain
    }

    pub fn mode(&self) -> ReplyMode {
        self.mode
    }

    /// The number of replies and redirects not sent yet.
    pub fn waiting(&self) -> usize {
        self.waiting.get()
    }

    /// Returns `true` if `requester` already received its selected locator.
    pub fn is_redirected(&self, requester: IpAddr) -> bool {
        self.privacy_done
            .contains(&self.selector.identity(requester))
    }
}

/// Outstanding map requests of a tunnel router, used to drop duplicates and to measure how long
/// resolution took.
#[derive(Debug, Clone)]
pub struct MapRequestLog {
    prefix_len: u8,
    sent: HashMap<Prefix, Timestamp>,
}

impl MapRequestLog {
    pub fn new(prefix_len: u8) -> Self {
        Self {
            prefix_len,
            sent: HashMap::new(),
        }
    }

    /// Records a request for `eid`, returns `false` if one is already outstanding.
    pub fn should_request(&mut self, eid: IpAddr, now: Timestamp) -> bool {
        let prefix = Prefix::new(eid, self.prefix_len);
        if self.sent.contains_key(&prefix) {
            debug!(prefix = %prefix, "map request already outstanding");
            return false;
        }

        self.sent.insert(prefix, now);
        true
    }

    /// Settles every outstanding request covered by `reply`, reporting each mapping delay.
    /// Returns the number of requests settled.
    pub fn on_reply<R: Reporter>(
        &mut self,
        reply: &MapReply,
        now: Timestamp,
        reporter: &mut R,
    ) -> usize {
        let mut settled = 0;

        self.sent.retain(|prefix, sent_at| {
            if !reply.prefix.contains(prefix.network()) {
                return true;
            }

            reporter.mapping_delay(*prefix, now.since(*sent_at));
            settled += 1;
            false
        });

        settled
    }

    pub fn is_outstanding(&self, eid: IpAddr) -> bool {
        self.sent.contains_key(&Prefix::new(eid, self.prefix_len))
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}
