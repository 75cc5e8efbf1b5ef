// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol for the upstream session.
//!
//! Length-prefixed `serde_json` frames carry both the one-shot subscription
//! handshake and the post-handshake asynchronous traffic in both directions
//! over the same socket. See [`crate::transport`] for the framing itself.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use serde::{Deserialize, Serialize};

/// A 32-bit bitmask over elemental feed codes. `0` is the `NONE` sentinel.
pub type FeedMask = u32;

/// A 16-byte product content signature.
pub type Signature = [u8; 16];

/// Hex-string wire form of a [`Signature`], for JSON compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureWire(pub String);

impl From<Signature> for SignatureWire {
    fn from(sig: Signature) -> Self {
        Self(hex::encode(sig))
    }
}

impl TryFrom<SignatureWire> for Signature {
    type Error = ProtocolError;

    fn try_from(wire: SignatureWire) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&wire.0).map_err(|_| ProtocolError::InvalidSignature)?;
        if bytes.len() != 16 {
            return Err(ProtocolError::InvalidSignature);
        }
        let mut sig = [0u8; 16];
        sig.copy_from_slice(&bytes);
        Ok(sig)
    }
}

/// A virtual-circuit endpoint: `(switchId, portId, vlanId)`.
///
/// Either endpoint whose `switch_id` or `port_id` begins with `"dummy"`
/// makes the whole circuit a test-mode no-op (see [`crate::circuit`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcEndpoint {
    pub switch_id: String,
    pub port_id: String,
    pub vlan_id: u16,
}

impl VcEndpoint {
    pub fn is_dummy(&self) -> bool {
        self.switch_id.starts_with("dummy") || self.port_id.starts_with("dummy")
    }
}

/// Request body of the synchronous `subscribe` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub desired_feed: FeedMask,
    pub vc_end: VcEndpoint,
}

/// A CIDR-tagged IPv4 address, e.g. an allocated FMTP client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrAddr {
    pub addr: std::net::Ipv4Addr,
    pub prefix_len: u8,
}

impl std::fmt::Display for CidrAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Coordinates handed back on a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionCoordinates {
    pub mcast_group: std::net::SocketAddrV4,
    pub fmtp_server: std::net::SocketAddr,
    pub fmtp_client_addr: CidrAddr,
}

/// Outcome of the synchronous `subscribe` RPC.
///
/// `Unauth` and `Noent` are normal, peer-visible replies; only a missing
/// `Ok` (i.e. the RPC call itself failing) represents a session failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum SubscriptionReply {
    #[serde(rename = "UNAUTH")]
    Unauth,
    #[serde(rename = "NOENT")]
    Noent,
    #[serde(rename = "OK")]
    Ok {
        #[serde(flatten)]
        coordinates: SubscriptionCoordinates,
    },
}

/// Request body of the asynchronous `requestBacklog` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogSpec {
    pub feed: FeedMask,
    pub after_is_set: bool,
    pub after: SignatureWire,
    pub time_offset_secs: u64,
    pub before: SignatureWire,
}

/// Metadata describing a product, as delivered to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInfo {
    pub signature: SignatureWire,
    pub feed: FeedMask,
    pub seq: u64,
    pub timestamp_unix: i64,
    pub origin: String,
    pub size: u32,
}

/// Post-handshake, one-way messages carried in both directions over the
/// session socket. No variant here ever receives a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionMessage {
    /// peer -> engine: look up a missed product by multicast sequence index.
    #[serde(rename = "request_product")]
    RequestProduct { index: u64 },

    /// peer -> engine: replay the backlog described by `spec`.
    #[serde(rename = "request_backlog")]
    RequestBacklog { spec: BacklogSpec },

    /// peer -> engine: liveness probe, no response expected.
    #[serde(rename = "test_connection")]
    TestConnection,

    /// engine -> peer: deliver a product located via the index map.
    #[serde(rename = "deliver_missed_product")]
    DeliverMissedProduct {
        index: u64,
        info: ProductInfo,
        data: Vec<u8>,
    },

    /// engine -> peer: deliver a product found during backlog replay.
    #[serde(rename = "deliver_backlog_product")]
    DeliverBacklogProduct { info: ProductInfo, data: Vec<u8> },

    /// engine -> peer: the requested sequence index has no known product.
    #[serde(rename = "no_such_product")]
    NoSuchProduct { index: u64 },

    /// engine -> peer: a fatal, session-ending error occurred.
    #[serde(rename = "error")]
    Error { code: u32, message: String },
}

/// Protocol-level error types (malformed wire values, not I/O).
#[derive(Debug, Clone)]
pub enum ProtocolError {
    InvalidSignature,
    InvalidMessage(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::InvalidMessage(s) => write!(f, "invalid message: {}", s),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Hex encoding/decoding utilities (no external dependency needed for 16 bytes).
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes
            .as_ref()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ()> {
        if s.len() % 2 != 0 {
            return Err(());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
            .collect()
    }
}
