//! Request deduplication and pacing on the resolution path.
//!
//! The cache keeps two things: for every querying host (keyed by its source EID), the prefixes
//! it already asked about (those requests are dropped), and for every prefix, the lifecycle of
//! the upstream search. A host's record of a prefix lasts as long as the search does: a negative
//! answer, an expired search or removal lets it ask again.
//! Requests that arrive while a search is in flight are released just after the search is
//! expected to finish, spaced by `epsilon` so that they keep their arrival order.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use tracing::{debug, warn};

use crate::{
    config::ResolverConfig,
    core::{
        clock::{non_negative, Duration, Timestamp},
        identity::Prefix,
        message::MapRequest,
        traits::{EventId, Scheduler},
    },
    error::ConfigError,
};

/// Where the upstream search for a prefix stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// A search is in flight.
    Pending,
    /// An answer is on its way, requests can go straight through.
    CachedTrue,
    /// The upstream had nothing; the next request searches again.
    CachedFalse,
}

/// Cache entry for one target prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub prefix: Prefix,
    pub first_seen: Timestamp,
    pub state: ResolutionState,
    /// Requests admitted for this prefix since the search started.
    pub waiting: u64,
}

/// What the caller should do with an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Nothing is known about the prefix: start the search.
    IssueNow,
    /// A search is in flight: issue once it should have completed.
    IssueAfter(Duration),
    /// The prefix is resolved: issue without delay.
    IssueImmediately,
}

/// Tracks in-flight resolutions per prefix and already-asked prefixes per source.
#[derive(Debug, Clone)]
pub struct RequestDeduplicationCache {
    search_window: Duration,
    epsilon: Duration,
    pending_ttl: Option<Duration>,
    asked: HashMap<IpAddr, HashSet<Prefix>>,
    entries: HashMap<Prefix, PendingRequest>,
    admitted: u64,
}

impl RequestDeduplicationCache {
    pub fn new(search_window: Duration, epsilon: Duration, pending_ttl: Option<Duration>) -> Self {
        Self {
            search_window,
            epsilon,
            pending_ttl,
            asked: HashMap::new(),
            entries: HashMap::new(),
            admitted: 0,
        }
    }

    pub fn from_config(config: &ResolverConfig) -> Self {
        Self::new(config.search_window(), config.epsilon(), config.pending_ttl())
    }

    /// Records that `source` asked for `prefix`, returns `true` if it already had.
    ///
    /// A search that outlived the TTL no longer counts as asked, so its requesters can retry.
    pub fn should_suppress(&mut self, source: IpAddr, prefix: Prefix, now: Timestamp) -> bool {
        if self.is_expired(prefix, now) {
            self.forget(prefix);
        }

        !self.asked.entry(source).or_default().insert(prefix)
    }

    /// Admits a request for `prefix` arriving at `now`.
    pub fn admit(&mut self, prefix: Prefix, now: Timestamp) -> Admission {
        self.admitted += 1;

        let entry = match self.entries.get_mut(&prefix) {
            Some(entry) => entry,
            None => {
                self.entries.insert(prefix, Self::fresh(prefix, now));
                return Admission::IssueNow;
            }
        };

        match entry.state {
            ResolutionState::CachedTrue => Admission::IssueImmediately,
            ResolutionState::CachedFalse => {
                debug!(prefix = %prefix, "re-searching after a negative answer");
                *entry = Self::fresh(prefix, now);
                Admission::IssueNow
            }
            ResolutionState::Pending => {
                let elapsed = now.since(entry.first_seen);

                if matches!(self.pending_ttl, Some(ttl) if elapsed > ttl) {
                    warn!(
                        prefix = %prefix,
                        elapsed = ?elapsed,
                        "pending search expired, restarting it"
                    );
                    *entry = Self::fresh(prefix, now);
                    return Admission::IssueNow;
                }

                entry.waiting += 1;
                let spacing = self.epsilon * self.admitted as u32;
                Admission::IssueAfter(non_negative(self.search_window - elapsed + spacing))
            }
        }
    }

    /// Marks the search for `prefix` as answered; returns `false` if the prefix is unknown.
    pub fn mark_resolved(&mut self, prefix: Prefix) -> bool {
        self.set_state(prefix, ResolutionState::CachedTrue)
    }

    /// Marks the search for `prefix` as negatively answered; every source may ask again.
    pub fn mark_negative(&mut self, prefix: Prefix) -> bool {
        self.forget(prefix);
        self.set_state(prefix, ResolutionState::CachedFalse)
    }

    /// Drops the entry for `prefix` together with every source's record of asking for it.
    pub fn remove(&mut self, prefix: Prefix) -> Option<PendingRequest> {
        self.forget(prefix);
        self.entries.remove(&prefix)
    }

    /// Drops pending entries older than the TTL, returns how many were dropped.
    pub fn evict_expired(&mut self, now: Timestamp) -> usize {
        let Some(ttl) = self.pending_ttl else {
            return 0;
        };

        let expired: Vec<Prefix> = self
            .entries
            .values()
            .filter(|entry| {
                entry.state == ResolutionState::Pending && now.since(entry.first_seen) > ttl
            })
            .map(|entry| entry.prefix)
            .collect();

        for prefix in &expired {
            self.remove(*prefix);
        }

        expired.len()
    }

    pub fn get(&self, prefix: Prefix) -> Option<&PendingRequest> {
        self.entries.get(&prefix)
    }

    /// The number of tracked prefixes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of sources with at least one recorded request.
    pub fn sources(&self) -> usize {
        self.asked.len()
    }

    /// Returns `true` if `source` is recorded as having asked for `prefix`.
    pub fn has_asked(&self, source: IpAddr, prefix: Prefix) -> bool {
        self.asked
            .get(&source)
            .is_some_and(|prefixes| prefixes.contains(&prefix))
    }

    /// The number of requests admitted over the cache's lifetime.
    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    fn fresh(prefix: Prefix, now: Timestamp) -> PendingRequest {
        PendingRequest {
            prefix,
            first_seen: now,
            state: ResolutionState::Pending,
            waiting: 1,
        }
    }

    fn is_expired(&self, prefix: Prefix, now: Timestamp) -> bool {
        match (self.entries.get(&prefix), self.pending_ttl) {
            (Some(entry), Some(ttl)) => {
                entry.state == ResolutionState::Pending && now.since(entry.first_seen) > ttl
            }
            _ => false,
        }
    }

    // Sources that asked for nothing else are dropped with it.
    fn forget(&mut self, prefix: Prefix) {
        self.asked.retain(|_, prefixes| {
            prefixes.remove(&prefix);
            !prefixes.is_empty()
        });
    }

    fn set_state(&mut self, prefix: Prefix, state: ResolutionState) -> bool {
        match self.entries.get_mut(&prefix) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }
}

/// Timers of the resolver role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
    /// Forward `request` upstream.
    Forward { request: MapRequest, prefix: Prefix },
}

/// A map resolver that paces requests through a [`RequestDeduplicationCache`].
///
/// The first request for a prefix is held for the modeled search time, later ones are released
/// right behind it, and repeats from the same requester are dropped.
#[derive(Debug, Clone)]
pub struct PrivacyResolver {
    cache: RequestDeduplicationCache,
    prefix_len: u8,
}

impl PrivacyResolver {
    pub fn new(config: &ResolverConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            cache: RequestDeduplicationCache::from_config(config),
            prefix_len: config.prefix_len,
        })
    }

    /// Handles an inbound map request, returns the forward timer if the request was admitted.
    pub fn on_request<E, S>(&mut self, request: MapRequest, scheduler: &mut S) -> Option<EventId>
    where
        E: From<ResolverEvent>,
        S: Scheduler<E>,
    {
        let prefix = Prefix::new(request.eid, self.prefix_len);

        let now = scheduler.now();

        if self.cache.should_suppress(request.source_eid, prefix, now) {
            debug!(
                source = %request.source_eid,
                prefix = %prefix,
                "dropping repeated map request"
            );
            return None;
        }

        let delay = match self.cache.admit(prefix, now) {
            Admission::IssueNow => self.cache.search_window,
            Admission::IssueAfter(delay) => delay,
            Admission::IssueImmediately => Duration::ZERO,
        };
        debug!(prefix = %prefix, delay = ?delay, "scheduling map request forward");

        Some(scheduler.schedule(delay, ResolverEvent::Forward { request, prefix }.into()))
    }

    /// Handles a fired forward timer, returns the request to send upstream.
    pub fn on_event(&mut self, event: ResolverEvent) -> MapRequest {
        match event {
            ResolverEvent::Forward { request, prefix } => {
                self.cache.mark_resolved(prefix);
                request
            }
        }
    }

    /// Records that the upstream had no mapping for `eid`.
    pub fn on_negative_reply(&mut self, eid: IpAddr) {
        self.cache.mark_negative(Prefix::new(eid, self.prefix_len));
    }

    pub fn cache(&self) -> &RequestDeduplicationCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut RequestDeduplicationCache {
        &mut self.cache
    }
}
