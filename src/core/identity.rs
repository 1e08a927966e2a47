//! Peer identity types.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use serde::{Deserialize, Serialize};

/// Returns the number of bits in the address family of `addr`.
pub fn address_width(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Zeroes every bit of `addr` past the first `len` bits. Lengths wider than the address family
/// are clamped to the family width.
pub fn mask_addr(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let len = u32::from(len.min(32));
            let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let len = u32::from(len.min(128));
            let mask = u128::MAX.checked_shl(128 - len).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// The hash input standing for a remote peer: either its full address or the address coarsened
/// to a prefix, in which case every peer of that prefix shares one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    addr: IpAddr,
    prefix_len: u8,
}

impl PeerIdentity {
    /// An identity covering exactly one address.
    pub fn exact(addr: IpAddr) -> Self {
        Self {
            addr,
            prefix_len: address_width(&addr),
        }
    }

    /// An identity covering every address sharing the first `prefix_len` bits with `addr`.
    pub fn masked(addr: IpAddr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(address_width(&addr));

        Self {
            addr: mask_addr(addr, prefix_len),
            prefix_len,
        }
    }

    /// Builds the identity for `addr` with an optional coarsening mask.
    pub fn new(addr: IpAddr, mask: Option<u8>) -> Self {
        match mask {
            Some(len) => Self::masked(addr, len),
            None => Self::exact(addr),
        }
    }

    /// Returns the (masked) address backing the identity.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns `true` if `addr` collapses onto this identity.
    pub fn covers(&self, addr: IpAddr) -> bool {
        address_width(&addr) == address_width(&self.addr)
            && mask_addr(addr, self.prefix_len) == self.addr
    }

    /// Stable 32-bit hash of the identity's textual form.
    ///
    /// Every party that selects or verifies an address must agree on this function, so it only
    /// depends on the masked address as printed in its canonical form (`192.0.2.0`), never on
    /// process state.
    pub fn hash32(&self) -> u32 {
        crc32fast::hash(self.addr.to_string().as_bytes())
    }

    #[doc(hidden)]
    /// Convenience function for generating random IPv4 identities during testing.
    pub fn rand() -> Self {
        use rand::{thread_rng, Rng};

        let mut rng = thread_rng();
        let raw: u32 = rng.gen();

        Self::exact(IpAddr::V4(Ipv4Addr::from(raw)))
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix_len == address_width(&self.addr) {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix_len)
        }
    }
}

/// A coarsened identifier, e.g. an EID masked to `/24`, used as the key of resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Prefix {
    network: IpAddr,
    len: u8,
}

impl Prefix {
    pub fn new(addr: IpAddr, len: u8) -> Self {
        let len = len.min(address_width(&addr));

        Self {
            network: mask_addr(addr, len),
            len,
        }
    }

    /// Returns the network address (host bits zeroed).
    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Returns `true` if `addr` falls within the prefix.
    pub fn contains(&self, addr: IpAddr) -> bool {
        address_width(&addr) == address_width(&self.network)
            && mask_addr(addr, self.len) == self.network
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.len)
    }
}
