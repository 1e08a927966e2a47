//! Error types.
//!
//! Configuration errors are fatal to the embedding node; everything else is reported so the
//! caller can log it and drop the affected packet or connection.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::core::identity::PeerIdentity;

/// Operator configuration mistakes, detected at set-up time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("the {role} address pool is empty")]
    EmptyPool { role: &'static str },
    #[error("conflicting privacy modes enabled: {first} and {second}")]
    ConflictingPrivacyModes {
        first: &'static str,
        second: &'static str,
    },
    #[error("invalid identity prefix length /{0}")]
    InvalidPrefixLength(u8),
    #[error("invalid cost model: {0}")]
    InvalidCost(String),
    #[error("no {0} address configured")]
    MissingAddress(&'static str),
}

/// Returned when selecting from an empty pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("cannot select from an empty address pool")]
    EmptyPool,
}

/// A listening or sending socket couldn't be bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to bind {addr}: {reason}")]
pub struct BindError {
    pub addr: SocketAddr,
    pub reason: String,
}

/// Any other carrier failure; these are logged and never abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown transport handle")]
    UnknownHandle,
    #[error("connection to {0} failed")]
    ConnectFailed(SocketAddr),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Outcomes of the consistency checks that the caller may want to escalate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{peer} reached {actual}, expected {expected}")]
    EidMismatch {
        peer: IpAddr,
        expected: IpAddr,
        actual: IpAddr,
    },
    #[error("{peer} used locator {actual}, expected {expected}")]
    RlocMismatch {
        peer: IpAddr,
        expected: IpAddr,
        actual: IpAddr,
    },
    #[error("{peer} addressed pool member {actual} directly")]
    BypassedService { peer: IpAddr, actual: IpAddr },
    #[error("{identity} failed {count} consistency checks")]
    RepeatedViolations { identity: PeerIdentity, count: u32 },
    #[error(transparent)]
    Select(#[from] SelectError),
}

/// Crate-level error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl Error {
    /// Returns `true` if the error must abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Select(_)
                | Error::Bind(_)
                | Error::Verify(VerifyError::RepeatedViolations { .. } | VerifyError::Select(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(Error::from(ConfigError::EmptyPool { role: "server" }).is_fatal());
        assert!(Error::from(SelectError::EmptyPool).is_fatal());
        assert!(Error::from(BindError {
            addr: "127.0.0.1:1".parse().unwrap(),
            reason: "in use".into()
        })
        .is_fatal());
        assert!(!Error::from(TransportError::UnknownHandle).is_fatal());
        assert!(!Error::from(VerifyError::EidMismatch {
            peer: "192.0.2.1".parse().unwrap(),
            expected: "10.0.0.1".parse().unwrap(),
            actual: "10.0.0.2".parse().unwrap(),
        })
        .is_fatal());
    }

    #[test]
    fn messages() {
        let err = ConfigError::ConflictingPrivacyModes {
            first: "rloc_redirect",
            second: "fast_redirect",
        };
        assert_eq!(
            err.to_string(),
            "conflicting privacy modes enabled: rloc_redirect and fast_redirect"
        );
    }
}
