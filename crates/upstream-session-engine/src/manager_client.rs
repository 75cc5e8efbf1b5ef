// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast manager client.
//!
//! The multicast manager is a sibling process that owns the multicast
//! publisher lifecycle and the FMTP client address pool for each feed. The
//! engine asks it to ensure a publisher exists and to allocate a client
//! address on handshake, and releases that address unconditionally on
//! teardown, using the same length-prefixed JSON framing as the
//! peer-facing transport. `subscribe` must be safe under
//! process-parallel contention (the manager serializes internally); both
//! calls must tolerate being issued more than once for the same feed.

use crate::protocol::{CidrAddr, FeedMask, SubscriptionCoordinates};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op")]
enum ManagerRequest {
    Subscribe { feed: FeedMask, peer: IpAddr },
    Unsubscribe { feed: FeedMask, allocated: CidrAddr },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status")]
enum ManagerReply {
    Ok {
        #[serde(flatten)]
        coordinates: SubscriptionCoordinates,
    },
    /// The feed is a valid, policy-allowed feed but has no active
    /// publisher; distinct from a transport/system failure.
    Noent,
    Unsubscribed,
    Error { message: String },
}

/// Errors from talking to the multicast manager.
#[derive(Debug)]
pub enum ManagerError {
    Io(String),
    Protocol(String),
    /// The feed has no active publisher. A normal, expected outcome of
    /// `subscribe`, not a system failure.
    Noent,
    Refused(String),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error talking to multicast manager: {}", s),
            Self::Protocol(s) => write!(f, "multicast manager protocol error: {}", s),
            Self::Noent => write!(f, "feed has no active multicast publisher"),
            Self::Refused(s) => write!(f, "multicast manager refused request: {}", s),
        }
    }
}

impl std::error::Error for ManagerError {}

/// Abstraction over the multicast manager, so the handshake and
/// teardown paths can be exercised in tests without a live manager
/// process.
#[async_trait::async_trait]
pub trait MulticastManagerClient: Send + Sync {
    /// Ensures a publisher exists for `feed` and allocates an FMTP client
    /// address for `peer` from its pool, returning the publisher's
    /// coordinates. `Err(ManagerError::Noent)` means the feed is valid but
    /// not currently multicast.
    async fn subscribe(&self, feed: FeedMask, peer: IpAddr) -> Result<SubscriptionCoordinates, ManagerError>;

    /// Idempotent release of a previously allocated client address. Must
    /// tolerate "never subscribed" and "already released".
    async fn unsubscribe(&self, feed: FeedMask, allocated: CidrAddr) -> Result<(), ManagerError>;
}

/// Production client: opens a short-lived TCP connection per call.
pub struct TcpManagerClient {
    manager_addr: SocketAddr,
    timeout: Duration,
}

impl TcpManagerClient {
    pub fn new(manager_addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            manager_addr,
            timeout,
        }
    }

    async fn call(&self, request: &ManagerRequest) -> Result<ManagerReply, ManagerError> {
        let fut = async {
            let mut stream = TcpStream::connect(self.manager_addr)
                .await
                .map_err(|e| ManagerError::Io(e.to_string()))?;

            let body = serde_json::to_vec(request)
                .map_err(|e| ManagerError::Protocol(format!("serialize error: {}", e)))?;
            let len = body.len() as u32;
            stream
                .write_all(&len.to_be_bytes())
                .await
                .map_err(|e| ManagerError::Io(e.to_string()))?;
            stream
                .write_all(&body)
                .await
                .map_err(|e| ManagerError::Io(e.to_string()))?;
            stream.flush().await.map_err(|e| ManagerError::Io(e.to_string()))?;

            let mut len_buf = [0u8; 4];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| ManagerError::Io(e.to_string()))?;
            let reply_len = u32::from_be_bytes(len_buf) as usize;
            let mut reply_buf = vec![0u8; reply_len];
            stream
                .read_exact(&mut reply_buf)
                .await
                .map_err(|e| ManagerError::Io(e.to_string()))?;

            serde_json::from_slice(&reply_buf)
                .map_err(|e| ManagerError::Protocol(format!("invalid reply JSON: {}", e)))
        };

        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ManagerError::Io("timed out waiting for multicast manager".into()))?
    }
}

#[async_trait::async_trait]
impl MulticastManagerClient for TcpManagerClient {
    async fn subscribe(&self, feed: FeedMask, peer: IpAddr) -> Result<SubscriptionCoordinates, ManagerError> {
        match self.call(&ManagerRequest::Subscribe { feed, peer }).await? {
            ManagerReply::Ok { coordinates } => Ok(coordinates),
            ManagerReply::Noent => Err(ManagerError::Noent),
            ManagerReply::Error { message } => Err(ManagerError::Refused(message)),
            ManagerReply::Unsubscribed => Err(ManagerError::Protocol(
                "manager replied `Unsubscribed` to a subscribe request".into(),
            )),
        }
    }

    async fn unsubscribe(&self, feed: FeedMask, allocated: CidrAddr) -> Result<(), ManagerError> {
        match self.call(&ManagerRequest::Unsubscribe { feed, allocated }).await? {
            ManagerReply::Unsubscribed => Ok(()),
            ManagerReply::Error { message } => Err(ManagerError::Refused(message)),
            ManagerReply::Ok { .. } | ManagerReply::Noent => Err(ManagerError::Protocol(
                "manager replied unexpectedly to an unsubscribe request".into(),
            )),
        }
    }
}
