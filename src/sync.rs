//! Shared handles for multi-threaded embeddings.
//!
//! The controllers are plain single-owner state machines. When several tasks need the same
//! verifier or reply generator, these wrappers put it behind an `Arc<RwLock<_>>` so every
//! operation runs under the lock, one at a time.

use std::{net::IpAddr, sync::Arc};

use parking_lot::RwLock;

use crate::{
    core::{
        message::MapRequest,
        traits::{EventId, MappingDatabase, Scheduler},
    },
    error::{SelectError, VerifyError},
    reply::{Outbound, PrivacyMapReplyGenerator, ReplyEvent},
    verifier::{Arrival, ConsistencyVerifier, Verdict, VerifierEvent},
};

#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Debug, Clone)]
/// A [`ConsistencyVerifier`] that can be shared across tasks.
pub struct SyncVerifier {
    verifier: Arc<RwLock<ConsistencyVerifier>>,
}

impl SyncVerifier {
    pub fn new(verifier: ConsistencyVerifier) -> Self {
        Self {
            verifier: Arc::new(RwLock::new(verifier)),
        }
    }

    pub fn verify<P>(&self, arrival: &Arrival<P>) -> Result<Verdict, VerifyError> {
        self.verifier.write().verify(arrival)
    }

    pub fn on_arrival<P, E, S>(
        &self,
        arrival: Arrival<P>,
        scheduler: &mut S,
    ) -> Result<Option<EventId>, VerifyError>
    where
        E: From<VerifierEvent<P>>,
        S: Scheduler<E>,
    {
        self.verifier.write().on_arrival(arrival, scheduler)
    }

    pub fn on_event<P>(&self, event: VerifierEvent<P>) -> Arrival<P> {
        self.verifier.write().on_event(event)
    }

    pub fn check_rloc(
        &self,
        source: IpAddr,
        outer_destination: IpAddr,
    ) -> Result<bool, VerifyError> {
        self.verifier.read().check_rloc(source, outer_destination)
    }

    pub fn check_eid(&self, source: IpAddr, destination: IpAddr) -> Result<bool, VerifyError> {
        self.verifier.read().check_eid(source, destination)
    }

    pub fn violations(&self, source: IpAddr) -> u32 {
        self.verifier.read().violations(source)
    }

    pub fn forgive(&self, source: IpAddr) {
        self.verifier.write().forgive(source)
    }

    pub fn waiting(&self) -> usize {
        self.verifier.read().waiting()
    }
}

#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Debug, Clone)]
/// A [`PrivacyMapReplyGenerator`] that can be shared across tasks.
pub struct SyncReplyGenerator {
    generator: Arc<RwLock<PrivacyMapReplyGenerator>>,
}

impl SyncReplyGenerator {
    pub fn new(generator: PrivacyMapReplyGenerator) -> Self {
        Self {
            generator: Arc::new(RwLock::new(generator)),
        }
    }

    pub fn generate<E, S, D>(
        &self,
        request: &MapRequest,
        db: &D,
        scheduler: &mut S,
    ) -> Result<Option<EventId>, SelectError>
    where
        E: From<ReplyEvent>,
        S: Scheduler<E>,
        D: MappingDatabase + ?Sized,
    {
        self.generator.write().generate(request, db, scheduler)
    }

    pub fn on_event(&self, event: ReplyEvent) -> Result<Outbound, SelectError> {
        self.generator.write().on_event(event)
    }

    pub fn proxy_reply_allowed(&self) -> bool {
        self.generator.read().proxy_reply_allowed()
    }

    pub fn is_redirected(&self, requester: IpAddr) -> bool {
        self.generator.read().is_redirected(requester)
    }

    pub fn waiting(&self) -> usize {
        self.generator.read().waiting()
    }
}
