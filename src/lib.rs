//! An identity-hashed redirection layer for locator/identifier split protocols.
//!
//! A site that wants to hide how many service endpoints and locators it has, and which is
//! which, answers every peer with the address a stable hash of the peer's identity selects from
//! a pool. Both the party that selects and the party that later verifies evaluate the same
//! function, so no per-peer state has to be shared between them.
//!
//! The engine is split into five pieces:
//!
//! 1. [`AddressSelector`](selector::AddressSelector): `hash32(identity) mod len(pool)`.
//! 2. [`RequestDeduplicationCache`](dedup::RequestDeduplicationCache): suppresses repeated
//!    resolution requests and paces concurrent ones behind an in-flight search.
//! 3. The redirection roles in [`redirect`]: an entrance that sends first contacts to their
//!    selected server, the client that follows the redirect and the server that checks it.
//! 4. [`PrivacyMapReplyGenerator`](reply::PrivacyMapReplyGenerator): answers map requests with
//!    the real locators, a single selected locator, or the real locators plus a data-plane
//!    redirect.
//! 5. [`ConsistencyVerifier`](verifier::ConsistencyVerifier): drops arriving traffic whose
//!    addressing disagrees with the selection.
//!
//! Everything is driven through a [`Scheduler`]: modeled processing costs are timer offsets,
//! scaled by the number of operations an entity has in flight. [`SimScheduler`] runs them on a
//! deterministic logical clock; with the `sync` feature, `TokioScheduler` runs them on wall-clock
//! timers.

#![cfg_attr(doc_cfg, feature(doc_cfg))]

#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod redirect;
pub mod reply;
pub mod scheduler;
pub mod selector;
#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
pub mod sync;
pub mod verifier;

mod core;

pub use crate::core::{
    clock::{Duration, Timestamp},
    cost::{CostModel, DelaySampler},
    identity::{PeerIdentity, Prefix},
    message,
    pool::{AddressPool, SitePools},
    traits::{EventId, MappingDatabase, Reporter, Scheduler, Transport},
    waiting::{WaitingCounter, WaitingGuard},
};
pub use crate::scheduler::SimScheduler;
