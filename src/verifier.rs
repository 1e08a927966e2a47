//! Arrival-side consistency checks.
//!
//! Before a packet reaches its next stage, the verifier re-derives the address its source
//! should have used and drops it if the packet disagrees. Every check costs one modeled hash;
//! accepted packets are delivered after `hash × checks × waiting`, which keeps the cost of the
//! checks comparable with the other delayed operations.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use tracing::{debug, info, warn};

use crate::{
    config::PrivacyConfig,
    core::{
        cost::DelaySampler,
        identity::PeerIdentity,
        pool::SitePools,
        clock::{Duration, Timestamp},
        traits::{EventId, Scheduler},
        waiting::{WaitingCounter, WaitingGuard},
    },
    error::{ConfigError, VerifyError},
    selector::AddressSelector,
};

/// A packet arriving at a privacy-enabled node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival<P> {
    /// The inner (identifier) source.
    pub source: IpAddr,
    /// The inner (identifier) destination, rewritten under reverse NAT.
    pub destination: IpAddr,
    /// The outer locator the packet was tunnelled to, if it was encapsulated.
    pub outer_destination: Option<IpAddr>,
    pub payload: P,
}

/// The outcome of verifying one arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the packet to `destination` after paying for `checks` hashes.
    Accept { destination: IpAddr, checks: u32 },
    /// Drop the packet.
    Reject(VerifyError),
}

/// Timers of the verifier.
#[derive(Debug)]
pub enum VerifierEvent<P> {
    /// Deliver an accepted packet.
    Deliver {
        arrival: Arrival<P>,
        ticket: WaitingGuard,
    },
}

/// Gatekeeper for traffic arriving at a privacy-enabled site.
#[derive(Debug)]
pub struct ConsistencyVerifier {
    eid_check: bool,
    rloc_check: bool,
    reverse_nat: bool,
    selector: AddressSelector,
    pools: SitePools,
    exempt: HashSet<IpAddr>,
    sampler: DelaySampler,
    // Packets accepted but not delivered yet.
    waiting: WaitingCounter,
    // Sources that already paid for their reverse NAT lookup, with when they last used it.
    translated: HashMap<PeerIdentity, Timestamp>,
    // Violation count and time of the latest violation.
    violations: HashMap<PeerIdentity, (u32, Timestamp)>,
    max_violations: u32,
    quiet_period: Option<Duration>,
    // The latest time seen through `on_arrival` or `expire`.
    now: Timestamp,
}

impl ConsistencyVerifier {
    pub fn new(config: &PrivacyConfig, pools: SitePools) -> Result<Self, ConfigError> {
        config.validate()?;

        if config.rloc_check {
            pools.rlocs.ensure_non_empty("rloc")?;
        }
        if config.eid_check || config.reverse_nat {
            pools.services.ensure_non_empty("service")?;
        }
        if config.reverse_nat && pools.public_service.is_none() {
            return Err(ConfigError::MissingAddress("public service"));
        }
        info!(
            eid_check = config.eid_check,
            rloc_check = config.rloc_check,
            reverse_nat = config.reverse_nat,
            "consistency verifier ready"
        );

        Ok(Self {
            eid_check: config.eid_check,
            rloc_check: config.rloc_check,
            reverse_nat: config.reverse_nat,
            selector: AddressSelector::masked(config.identity_prefix_len),
            pools,
            exempt: config.exempt_locators.iter().copied().collect(),
            sampler: DelaySampler::new(config.hash_cost, config.seed),
            waiting: WaitingCounter::new(),
            translated: HashMap::new(),
            violations: HashMap::new(),
            max_violations: config.max_violations,
            quiet_period: config.quiet_period(),
            now: Timestamp::ZERO,
        })
    }

    /// Checks that `source` tunnelled its traffic to the locator selected for it.
    pub fn check_rloc(
        &self,
        source: IpAddr,
        outer_destination: IpAddr,
    ) -> Result<bool, VerifyError> {
        if self.exempt.contains(&outer_destination) {
            return Ok(false);
        }

        let expected = self.selector.select(source, &self.pools.rlocs)?;
        if expected != outer_destination {
            return Err(VerifyError::RlocMismatch {
                peer: source,
                expected,
                actual: outer_destination,
            });
        }

        Ok(true)
    }

    /// Checks that traffic for the service reached the address selected for `source`.
    ///
    /// Destinations outside the service pool aren't checked.
    pub fn check_eid(&self, source: IpAddr, destination: IpAddr) -> Result<bool, VerifyError> {
        if !self.pools.services.contains(destination) {
            return Ok(false);
        }

        let expected = self.selector.select(source, &self.pools.services)?;
        if expected != destination {
            return Err(VerifyError::EidMismatch {
                peer: source,
                expected,
                actual: destination,
            });
        }

        Ok(true)
    }

    /// Decides the fate of `arrival` without scheduling anything.
    ///
    /// Mismatches are logged and rejected. A source that keeps failing is escalated: once it
    /// exceeds the configured number of violations, `RepeatedViolations` is returned instead.
    pub fn verify<P>(&mut self, arrival: &Arrival<P>) -> Result<Verdict, VerifyError> {
        let mut checks = 0;
        let mut destination = arrival.destination;

        let outcome = self.run_checks(arrival, &mut destination, &mut checks);
        match outcome {
            Ok(()) => Ok(Verdict::Accept {
                destination,
                checks,
            }),
            Err(e @ VerifyError::Select(_)) => Err(e),
            Err(e @ VerifyError::BypassedService { .. }) => {
                warn!(
                    source = %arrival.source,
                    "dropping packet that bypassed the public service address"
                );
                Ok(Verdict::Reject(e))
            }
            Err(e) => {
                let identity = self.selector.identity(arrival.source);
                let (count, last) = self
                    .violations
                    .entry(identity)
                    .or_insert((0, self.now));
                *count += 1;
                *last = self.now;
                let count = *count;
                warn!(
                    source = %arrival.source,
                    violations = count,
                    "dropping inconsistent packet: {e}"
                );

                if count > self.max_violations {
                    return Err(VerifyError::RepeatedViolations { identity, count });
                }

                Ok(Verdict::Reject(e))
            }
        }
    }

    /// Verifies `arrival` and schedules its delivery if it passes.
    pub fn on_arrival<P, E, S>(
        &mut self,
        mut arrival: Arrival<P>,
        scheduler: &mut S,
    ) -> Result<Option<EventId>, VerifyError>
    where
        E: From<VerifierEvent<P>>,
        S: Scheduler<E>,
    {
        self.expire(scheduler.now());

        let (destination, checks) = match self.verify(&arrival)? {
            Verdict::Accept {
                destination,
                checks,
            } => (destination, checks),
            Verdict::Reject(_) => return Ok(None),
        };

        if destination != arrival.destination {
            debug!(from = %arrival.destination, to = %destination, "rewrote service destination");
            arrival.destination = destination;
        }

        let ticket = self.waiting.enter();
        let delay = ticket.delay(self.sampler.sample() * checks);

        Ok(Some(scheduler.schedule(
            delay,
            VerifierEvent::Deliver { arrival, ticket }.into(),
        )))
    }

    /// Handles a fired timer, returning the packet to deliver.
    pub fn on_event<P>(&mut self, event: VerifierEvent<P>) -> Arrival<P> {
        match event {
            VerifierEvent::Deliver { arrival, ticket } => {
                drop(ticket);
                arrival
            }
        }
    }

    /// Advances the verifier's clock to `now` and drops the state of every source that has
    /// been quiet for longer than the quiet period. Returns how many records were dropped.
    ///
    /// `on_arrival` calls this on its own; callers of [`verify`](Self::verify) call it directly.
    pub fn expire(&mut self, now: Timestamp) -> usize {
        self.now = self.now.max(now);

        let Some(quiet) = self.quiet_period else {
            return 0;
        };

        let now = self.now;
        let before = self.violations.len() + self.translated.len();
        self.violations.retain(|_, (_, last)| now.since(*last) <= quiet);
        self.translated.retain(|_, last| now.since(*last) <= quiet);
        let dropped = before - self.violations.len() - self.translated.len();

        if dropped > 0 {
            debug!(dropped, "expired verifier records of quiet sources");
        }

        dropped
    }

    /// The number of source identities the verifier keeps state for.
    pub fn tracked(&self) -> usize {
        self.violations
            .keys()
            .chain(self.translated.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    /// The number of consistency violations recorded for `source`'s identity.
    pub fn violations(&self, source: IpAddr) -> u32 {
        self.violations
            .get(&self.selector.identity(source))
            .map(|(count, _)| *count)
            .unwrap_or_default()
    }

    /// Clears the violation record of `source`'s identity.
    pub fn forgive(&mut self, source: IpAddr) {
        self.violations.remove(&self.selector.identity(source));
    }

    /// The number of accepted packets not delivered yet.
    pub fn waiting(&self) -> usize {
        self.waiting.get()
    }

    fn run_checks<P>(
        &mut self,
        arrival: &Arrival<P>,
        destination: &mut IpAddr,
        checks: &mut u32,
    ) -> Result<(), VerifyError> {
        if self.rloc_check {
            if let Some(outer) = arrival.outer_destination {
                if self.check_rloc(arrival.source, outer)? {
                    *checks += 1;
                }
            }
        }

        if self.eid_check && self.check_eid(arrival.source, arrival.destination)? {
            *checks += 1;
        }

        if self.reverse_nat {
            if Some(arrival.destination) == self.pools.public_service {
                *destination = self.selector.select(arrival.source, &self.pools.services)?;

                // The lookup is remembered after the first packet.
                let identity = self.selector.identity(arrival.source);
                if self.translated.insert(identity, self.now).is_none() {
                    *checks += 1;
                }
            } else if self.pools.services.contains(arrival.destination) {
                return Err(VerifyError::BypassedService {
                    peer: arrival.source,
                    actual: arrival.destination,
                });
            }
        }

        Ok(())
    }
}
