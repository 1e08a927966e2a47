//! Deterministic, identity-derived address selection.
//!
//! `index = hash32(identity) mod len(pool)`. The hash is not meant to be unpredictable, it only
//! has to spread identities evenly and to give the selecting party and any later verifier the
//! same answer.

use std::net::IpAddr;

use tracing::debug;

use crate::{
    core::{clock::Timestamp, identity::PeerIdentity, pool::AddressPool},
    error::SelectError,
};

/// Picks the pool member assigned to `identity`.
pub fn select(identity: &PeerIdentity, pool: &AddressPool) -> Result<IpAddr, SelectError> {
    if pool.is_empty() {
        return Err(SelectError::EmptyPool);
    }

    let index = identity.hash32() as usize % pool.len();
    // The index is in bounds by construction.
    pool.get(index).ok_or(SelectError::EmptyPool)
}

/// The outcome of one selection, consumed once by whoever signals it to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectDecision {
    pub chosen: IpAddr,
    pub peer: PeerIdentity,
    pub at: Timestamp,
}

/// Address selection with a fixed identity coarsening mask.
///
/// The mask decides how many peers collapse onto the same chosen address: with `/24`, every
/// host of a client subnet is steered to the same locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressSelector {
    mask: Option<u8>,
}

impl AddressSelector {
    pub fn new(mask: Option<u8>) -> Self {
        Self { mask }
    }

    /// Hashes full peer addresses.
    pub fn exact() -> Self {
        Self { mask: None }
    }

    /// Hashes peer addresses masked to `prefix_len` bits.
    pub fn masked(prefix_len: u8) -> Self {
        Self {
            mask: Some(prefix_len),
        }
    }

    pub fn mask(&self) -> Option<u8> {
        self.mask
    }

    /// Returns the identity `peer` is hashed as.
    pub fn identity(&self, peer: IpAddr) -> PeerIdentity {
        PeerIdentity::new(peer, self.mask)
    }

    /// Selects the pool member assigned to `peer`.
    pub fn select(&self, peer: IpAddr, pool: &AddressPool) -> Result<IpAddr, SelectError> {
        select(&self.identity(peer), pool)
    }

    /// Selects for `peer` and records the decision.
    pub fn decide(
        &self,
        peer: IpAddr,
        pool: &AddressPool,
        at: Timestamp,
    ) -> Result<RedirectDecision, SelectError> {
        let identity = self.identity(peer);
        let chosen = select(&identity, pool)?;
        debug!(peer = %peer, identity = %identity, chosen = %chosen, "selected address");

        Ok(RedirectDecision {
            chosen,
            peer: identity,
            at,
        })
    }

    /// Returns `true` if `observed` is the address `peer` would have been assigned.
    pub fn matches(
        &self,
        peer: IpAddr,
        pool: &AddressPool,
        observed: IpAddr,
    ) -> Result<bool, SelectError> {
        Ok(self.select(peer, pool)? == observed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn pool(raw: &[&str]) -> AddressPool {
        raw.iter().map(|addr| addr.parse().unwrap()).collect()
    }

    #[test]
    fn empty_pool() {
        let identity = PeerIdentity::rand();
        assert_eq!(
            select(&identity, &AddressPool::new(vec![])),
            Err(SelectError::EmptyPool)
        );
    }

    #[test]
    fn single_member_pool() {
        let pool = pool(&["10.0.0.1"]);

        for _ in 0..100 {
            assert_eq!(
                select(&PeerIdentity::rand(), &pool),
                Ok("10.0.0.1".parse().unwrap())
            );
        }
    }

    #[test]
    fn deterministic() {
        const N: usize = 1000;

        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);

        for _ in 0..N {
            let identity = PeerIdentity::rand();
            assert_eq!(select(&identity, &pool), select(&identity, &pool));
        }
    }

    #[test]
    fn index_is_hash_modulo_len() {
        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let selector = AddressSelector::masked(24);
        let peer: IpAddr = "192.0.2.10".parse().unwrap();

        let index = crc32fast::hash(b"192.0.2.0") as usize % 3;
        assert_eq!(selector.select(peer, &pool), Ok(pool.get(index).unwrap()));
    }

    #[test]
    fn masked_peers_share_address() {
        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]);
        let selector = AddressSelector::masked(24);

        let expected = selector.select("192.0.2.10".parse().unwrap(), &pool);
        for host in 0..=255u8 {
            let peer = IpAddr::from([192, 0, 2, host]);
            assert_eq!(selector.select(peer, &pool), expected);
        }
    }

    #[test]
    fn distribution_sanity() {
        const N: usize = 20_000;

        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]);
        let mut counts: HashMap<IpAddr, usize> = HashMap::new();

        for i in 0..N as u32 {
            // Distinct identities spread across the address space.
            let raw = i.wrapping_mul(2_654_435_761).to_be_bytes();
            let identity = PeerIdentity::exact(IpAddr::from(raw));
            *counts.entry(select(&identity, &pool).unwrap()).or_default() += 1;
        }

        let expected = N / pool.len();
        assert_eq!(counts.len(), pool.len());
        for count in counts.values() {
            assert!(*count < expected * 3, "{count} exceeds 3x the fair share {expected}");
        }
    }

    #[test]
    fn decide_records_identity() {
        let pool = pool(&["10.0.0.1", "10.0.0.2"]);
        let selector = AddressSelector::masked(24);
        let at = Timestamp::from_secs_f64(1.5);

        let decision = selector
            .decide("192.0.2.10".parse().unwrap(), &pool, at)
            .unwrap();

        assert_eq!(decision.peer, PeerIdentity::masked("192.0.2.10".parse().unwrap(), 24));
        assert_eq!(decision.at, at);
        assert!(pool.contains(decision.chosen));
    }

    #[test]
    fn matches() {
        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let selector = AddressSelector::exact();
        let peer: IpAddr = "198.51.100.4".parse().unwrap();

        let chosen = selector.select(peer, &pool).unwrap();
        assert_eq!(selector.matches(peer, &pool, chosen), Ok(true));

        for other in pool.iter().filter(|addr| **addr != chosen) {
            assert_eq!(selector.matches(peer, &pool, *other), Ok(false));
        }
    }
}
