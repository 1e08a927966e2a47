//! Candidate locator pools.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An ordered, fixed list of candidate addresses exposed by one interface (e.g. a server's
/// service addresses or an xTR's RLOCs).
///
/// The pool is read-only once handed to the engine: index arithmetic relies on both the order
/// and the length staying put for as long as any party may select or verify against it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPool {
    addrs: Vec<IpAddr>,
}

impl AddressPool {
    /// Creates a pool from the supplied addresses, keeping their order.
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self { addrs }
    }

    /// Creates a pool, failing if it is empty.
    pub fn non_empty(role: &'static str, addrs: Vec<IpAddr>) -> Result<Self, ConfigError> {
        let pool = Self::new(addrs);
        pool.ensure_non_empty(role)?;

        Ok(pool)
    }

    /// Returns an error naming `role` if the pool can't be selected from.
    pub fn ensure_non_empty(&self, role: &'static str) -> Result<(), ConfigError> {
        if self.addrs.is_empty() {
            return Err(ConfigError::EmptyPool { role });
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Returns the address at `index`, if any.
    pub fn get(&self, index: usize) -> Option<IpAddr> {
        self.addrs.get(index).copied()
    }

    /// Returns the index of `addr` in the pool.
    pub fn position(&self, addr: IpAddr) -> Option<usize> {
        self.addrs.iter().position(|candidate| *candidate == addr)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.position(addr).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.addrs.iter()
    }

    pub fn as_slice(&self) -> &[IpAddr] {
        &self.addrs
    }
}

impl From<Vec<IpAddr>> for AddressPool {
    fn from(addrs: Vec<IpAddr>) -> Self {
        Self::new(addrs)
    }
}

impl FromIterator<IpAddr> for AddressPool {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// The pools a privacy-enabled site selects from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitePools {
    /// Locators of the site's tunnel router interfaces.
    pub rlocs: AddressPool,
    /// Addresses of the service behind the tunnel router.
    pub services: AddressPool,
    /// The public service address, rewritten to a pool member under reverse NAT.
    pub public_service: Option<IpAddr>,
}
