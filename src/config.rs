//! Configuration.
//!
//! Every tunable of the engine is a plain field on one of these structs. All of them deserialize
//! with missing fields falling back to the reference values, and all of them must pass
//! `validate()` before a role is built from them.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use time::Duration;
use tracing::error;

use crate::{
    core::{clock::secs_f64, cost::CostModel},
    error::ConfigError,
};

/// The longest meaningful identity prefix (IPv6).
const MAX_PREFIX_LEN: u8 = 128;

fn check_prefix_len(len: u8) -> Result<(), ConfigError> {
    if len > MAX_PREFIX_LEN {
        error!(len, "identity prefix length out of range");
        return Err(ConfigError::InvalidPrefixLength(len));
    }

    Ok(())
}

fn check_secs(name: &str, secs: f64) -> Result<(), ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        error!(name, secs, "invalid duration");
        return Err(ConfigError::InvalidCost(format!(
            "{name} must be a non-negative number of seconds, got {secs}"
        )));
    }

    Ok(())
}

/// How a privacy-enabled site answers map requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Answer with the real locator set.
    Plain,
    /// Answer with a single identity-selected locator.
    RlocRedirect,
    /// Answer with the real locator set and send a redirect packet on the side.
    FastRedirect,
}

/// Privacy modes of an xTR-like node and the costs they model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Verify that traffic reaches the service address selected for its source.
    pub eid_check: bool,
    /// Verify that traffic arrives on the locator selected for its inner source.
    pub rloc_check: bool,
    /// Answer map requests with a single selected locator.
    pub rloc_redirect: bool,
    /// Answer map requests normally and redirect through the data plane.
    pub fast_redirect: bool,
    /// Rewrite traffic for the public service address to the selected pool member.
    pub reverse_nat: bool,
    /// Identities are masked to this many bits before hashing.
    pub identity_prefix_len: u8,
    /// Cost of one hash.
    pub hash_cost: CostModel,
    /// Seed of the cost sampler.
    pub seed: u64,
    /// Consistency violations tolerated per source before the verifier escalates.
    pub max_violations: u32,
    /// Locators exempt from the RLOC check, e.g. the site's own control-plane locator.
    pub exempt_locators: Vec<IpAddr>,
    /// Per-source verifier state (violation counts, paid reverse NAT lookups) is dropped once a
    /// source has been quiet this long; `None` keeps it for the whole run.
    pub quiet_period_secs: Option<f64>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            eid_check: false,
            rloc_check: false,
            rloc_redirect: false,
            fast_redirect: false,
            reverse_nat: false,
            identity_prefix_len: 24,
            hash_cost: CostModel::HASH,
            seed: 0,
            max_violations: 16,
            exempt_locators: vec![IpAddr::from([10, 1, 1, 1])],
            quiet_period_secs: Some(60.0),
        }
    }
}

impl PrivacyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rloc_redirect && self.fast_redirect {
            error!("rloc redirect and fast redirect can't both be enabled");
            return Err(ConfigError::ConflictingPrivacyModes {
                first: "rloc_redirect",
                second: "fast_redirect",
            });
        }

        if self.eid_check && self.reverse_nat {
            error!("eid check and reverse nat can't both be enabled");
            return Err(ConfigError::ConflictingPrivacyModes {
                first: "eid_check",
                second: "reverse_nat",
            });
        }

        if let Some(quiet) = self.quiet_period_secs {
            check_secs("quiet_period_secs", quiet)?;
        }
        check_prefix_len(self.identity_prefix_len)?;
        self.hash_cost.validate()
    }

    pub fn quiet_period(&self) -> Option<Duration> {
        self.quiet_period_secs.map(secs_f64)
    }

    /// The reply strategy these flags select.
    pub fn reply_mode(&self) -> ReplyMode {
        debug_assert!(!(self.rloc_redirect && self.fast_redirect));

        if self.rloc_redirect {
            ReplyMode::RlocRedirect
        } else if self.fast_redirect {
            ReplyMode::FastRedirect
        } else {
            ReplyMode::Plain
        }
    }
}

/// Knobs of the entrance, client and server redirection roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Port the servers listen on, and the port redirect packets are sent from.
    pub server_port: u16,
    /// Port the client first contacts the entrance from.
    pub client_port: u16,
    /// Size of the client's application payload.
    pub payload_size: usize,
    /// Servers reject connections that reached the wrong pool address.
    pub check_address: bool,
    /// Time the client needs to act on a redirect.
    pub recompute_delay_secs: f64,
    /// Cost of one hash at the entrance or server.
    pub hash_cost: CostModel,
    /// Peer addresses are masked to this many bits before hashing, if set.
    pub identity_prefix_len: Option<u8>,
    /// Seed of the cost sampler.
    pub seed: u64,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            server_port: 50000,
            client_port: 41000,
            payload_size: 10,
            check_address: false,
            recompute_delay_secs: 0.01,
            hash_cost: CostModel::HASH,
            identity_prefix_len: None,
            seed: 0,
        }
    }
}

impl RedirectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("recompute_delay_secs", self.recompute_delay_secs)?;
        if let Some(len) = self.identity_prefix_len {
            check_prefix_len(len)?;
        }
        self.hash_cost.validate()
    }

    pub fn recompute_delay(&self) -> Duration {
        secs_f64(self.recompute_delay_secs)
    }
}

/// Knobs of the privacy-aware map resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How long an upstream search is assumed to take.
    pub search_window_secs: f64,
    /// Spacing between requests admitted for the same pending prefix.
    pub epsilon_nanos: u32,
    /// Pending entries older than this are considered lost; `None` keeps them forever.
    pub pending_ttl_secs: Option<f64>,
    /// Requested identifiers are masked to this many bits.
    pub prefix_len: u8,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            search_window_secs: 0.1,
            epsilon_nanos: 1,
            pending_ttl_secs: Some(1.0),
            prefix_len: 24,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("search_window_secs", self.search_window_secs)?;
        if let Some(ttl) = self.pending_ttl_secs {
            check_secs("pending_ttl_secs", ttl)?;
        }
        check_prefix_len(self.prefix_len)
    }

    pub fn search_window(&self) -> Duration {
        secs_f64(self.search_window_secs)
    }

    pub fn epsilon(&self) -> Duration {
        Duration::nanoseconds(self.epsilon_nanos.into())
    }

    pub fn pending_ttl(&self) -> Option<Duration> {
        self.pending_ttl_secs.map(secs_f64)
    }
}
