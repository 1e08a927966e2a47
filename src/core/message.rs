//! Protocol message types.
//!
//! Only the redirect signal has a wire format at this layer. Mapping-protocol messages are
//! reduced to the fields the redirection engine reads or writes; their encoding belongs to the
//! mapping subsystem.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::identity::Prefix;

pub type Nonce = u64;

/// The locators currently reachable for an identifier, in preference order.
pub type LocatorSet = Vec<IpAddr>;

/// The redirect header prepended to a payload on the carrier transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedirectHeader {
    pub redirect: bool,
}

impl RedirectHeader {
    /// The size of the serialized header in bytes.
    pub const SIZE: usize = 1;

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(u8::from(self.redirect));
    }

    /// Reads a header from the front of `src`, returns `None` if `src` is empty.
    pub fn decode(src: &mut impl Buf) -> Option<Self> {
        if !src.has_remaining() {
            return None;
        }

        // Any non-zero value is read as set.
        Some(Self {
            redirect: src.get_u8() != 0,
        })
    }
}

/// A redirect header together with the payload it precedes.
///
/// When `redirect` is set, the payload is the raw octets of the address the receiver should
/// reconnect to (4 bytes for IPv4, 16 for IPv6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectMessage {
    pub redirect: bool,
    pub payload: Bytes,
}

impl RedirectMessage {
    /// A redirect towards `target`.
    pub fn redirect_to(target: IpAddr) -> Self {
        let payload = match target {
            IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
        };

        Self {
            redirect: true,
            payload,
        }
    }

    /// A final, non-redirecting message.
    pub fn data(payload: Bytes) -> Self {
        Self {
            redirect: false,
            payload,
        }
    }

    pub fn header(&self) -> RedirectHeader {
        RedirectHeader {
            redirect: self.redirect,
        }
    }

    /// Returns the enclosed target if this is a redirect with a well-formed address payload.
    pub fn target(&self) -> Option<IpAddr> {
        if !self.redirect {
            return None;
        }

        match self.payload.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.payload);
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.payload);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    /// The encoded length, header included.
    pub fn encoded_len(&self) -> usize {
        RedirectHeader::SIZE + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        self.header().encode(dst);
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut dst);
        dst.freeze()
    }

    /// Decodes a full frame, returns `None` if the frame doesn't even hold a header.
    pub fn decode(mut src: Bytes) -> Option<Self> {
        let header = RedirectHeader::decode(&mut src)?;

        Some(Self {
            redirect: header.redirect,
            payload: src,
        })
    }
}

/// The parts of a map request the privacy engine looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub nonce: Nonce,
    /// The EID of the host whose traffic triggered the request.
    pub source_eid: IpAddr,
    /// The locator the reply should be sent to.
    pub itr_rloc: IpAddr,
    /// The EID being resolved.
    pub eid: IpAddr,
}

/// A database mapping: the locators registered for an EID prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub prefix: Prefix,
    pub locators: LocatorSet,
    pub version: u16,
}

/// The reply to a [`MapRequest`]; it must echo the request's nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapReply {
    pub nonce: Nonce,
    pub prefix: Prefix,
    pub locators: LocatorSet,
    pub version: u16,
    pub ttl_mins: u32,
}

impl MapReply {
    /// The default record TTL in minutes.
    pub const DEFAULT_TTL_MINS: u32 = 1440;

    /// Builds a positive reply for `request` carrying `locators` for the entry's prefix.
    pub fn for_request(request: &MapRequest, entry: &MapEntry, locators: LocatorSet) -> Self {
        Self {
            nonce: request.nonce,
            prefix: entry.prefix,
            locators,
            version: entry.version,
            ttl_mins: Self::DEFAULT_TTL_MINS,
        }
    }
}
