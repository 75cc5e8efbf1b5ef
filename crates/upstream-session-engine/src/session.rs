// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session state, handshake, and teardown.
//!
//! One `Session` is created per accepted connection and lives for the
//! lifetime of the process: there is exactly one downstream peer per
//! engine instance, so a single owned value does the job that a naive
//! port might otherwise reach for process-global variables to do.

use crate::circuit::{CircuitId, CircuitProvisioner, ProvisionError};
use crate::index_map::{IndexMapError, MmapIndexMap, ProductIndexMap};
use crate::manager_client::{ManagerError, MulticastManagerClient};
use crate::policy::{PolicyError, PolicyOracle};
use crate::product_queue::{ProductQueue, SqliteProductQueue};
use crate::protocol::{CidrAddr, FeedMask, SubscriptionReply, VcEndpoint};
use crate::transport::SessionTransport;
use std::net::IpAddr;
use std::path::Path;

const NONE_FEED: FeedMask = 0;

/// Errors raised while establishing or running a session, distinct from
/// the peer-visible [`SubscriptionReply`] rejections (`UNAUTH`/`NOENT`),
/// which are not errors at all.
#[derive(Debug)]
pub enum EngineError {
    Inval(String),
    Logic(String),
    Noent(String),
    Dup(String),
    Unauth(String),
    Mcast(String),
    Pq(String),
    System(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inval(s) => write!(f, "invalid argument: {}", s),
            Self::Logic(s) => write!(f, "logic error: {}", s),
            Self::Noent(s) => write!(f, "not found: {}", s),
            Self::Dup(s) => write!(f, "duplicate registration: {}", s),
            Self::Unauth(s) => write!(f, "unauthorized: {}", s),
            Self::Mcast(s) => write!(f, "multicast layer error: {}", s),
            Self::Pq(s) => write!(f, "product queue error: {}", s),
            Self::System(s) => write!(f, "system error: {}", s),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::System(e.to_string())
    }
}

impl From<ProvisionError> for EngineError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::Inval(s) => Self::Inval(s),
            ProvisionError::System(s) => Self::System(s),
        }
    }
}

impl From<crate::product_queue::ProductQueueError> for EngineError {
    fn from(e: crate::product_queue::ProductQueueError) -> Self {
        Self::Pq(e.to_string())
    }
}

impl From<ManagerError> for EngineError {
    fn from(e: ManagerError) -> Self {
        Self::Mcast(e.to_string())
    }
}

impl From<IndexMapError> for EngineError {
    fn from(e: IndexMapError) -> Self {
        Self::System(e.to_string())
    }
}

impl From<PolicyError> for EngineError {
    fn from(e: PolicyError) -> Self {
        Self::System(e.to_string())
    }
}

/// Monotonic counters updated by the dispatcher as session events occur.
/// Read-only from the outside; never sent to the peer.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub handshakes_attempted: u64,
    pub handshakes_accepted: u64,
    pub handshakes_rejected_unauth: u64,
    pub handshakes_rejected_noent: u64,
    pub missed_product_hits: u64,
    pub missed_product_misses: u64,
    pub backlog_products_delivered: u64,
    pub backlog_requests_stopped_at_before: u64,
    pub backlog_requests_ended_at_queue_end: u64,
    pub transport_errors: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}

/// The long-lived, per-process session state. Exactly one instance exists
/// per engine process, constructed empty before the handshake and filled
/// in by [`Session::handshake`].
pub struct Session {
    local_vc_end: VcEndpoint,
    index_map_dir: std::path::PathBuf,
    product_queue_path: std::path::PathBuf,

    feed: FeedMask,
    down_fmtp_addr: Option<CidrAddr>,
    vc_handle: Option<CircuitId>,
    vc_workgroup: Option<String>,
    index_map: Option<Box<dyn ProductIndexMap>>,
    product_queue: Option<Box<dyn ProductQueue>>,
    client_transport: Option<SessionTransport>,
    done: bool,

    pub stats: SessionStats,
}

impl Session {
    pub fn new(local_vc_end: VcEndpoint, product_queue_path: std::path::PathBuf, index_map_dir: std::path::PathBuf) -> Self {
        Self {
            local_vc_end,
            index_map_dir,
            product_queue_path,
            feed: NONE_FEED,
            down_fmtp_addr: None,
            vc_handle: None,
            vc_workgroup: None,
            index_map: None,
            product_queue: None,
            client_transport: None,
            done: false,
            stats: SessionStats::default(),
        }
    }

    pub fn feed(&self) -> FeedMask {
        self.feed
    }

    pub fn is_subscribed(&self) -> bool {
        self.feed != NONE_FEED
    }

    pub fn is_serving(&self) -> bool {
        self.client_transport.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn index_map(&self) -> Option<&dyn ProductIndexMap> {
        self.index_map.as_deref()
    }

    pub fn product_queue_mut(&mut self) -> Option<&mut (dyn ProductQueue + 'static)> {
        self.product_queue.as_deref_mut()
    }

    pub fn transport_mut(&mut self) -> Option<&mut SessionTransport> {
        self.client_transport.as_mut()
    }

    /// Installs the client RPC transport on a successful handshake. Must
    /// only be called after `handshake` has returned `SubscriptionReply::Ok`.
    pub fn install_transport(&mut self, transport: SessionTransport) {
        self.client_transport = Some(transport);
    }

    /// Runs the subscription handshake. Any step failing after
    /// having completed earlier steps unwinds those steps in reverse
    /// order before returning. Peer-visible rejections (`UNAUTH`,
    /// `NOENT`) are returned as `Ok(reply)`, not as `Err`.
    pub async fn handshake(
        &mut self,
        desired_feed: FeedMask,
        peer_vc_end: &VcEndpoint,
        peer_addr: IpAddr,
        policy: &dyn PolicyOracle,
        circuit: &mut dyn CircuitProvisioner,
        manager: &dyn MulticastManagerClient,
    ) -> Result<SubscriptionReply, EngineError> {
        self.stats.handshakes_attempted += 1;

        // Step 1: policy reduction.
        let allowed = policy.allowed_feeds(peer_addr)?;
        let reduced_feed = desired_feed & allowed;
        if reduced_feed == NONE_FEED {
            self.stats.handshakes_rejected_unauth += 1;
            return Ok(SubscriptionReply::Unauth);
        }

        // Step 2: provision the virtual circuit.
        let workgroup = format!("feed-{:08x}", reduced_feed);
        let description = format!("session circuit for feed 0x{:08x}", reduced_feed);
        let circuit_id = circuit.provision(&workgroup, &description, &self.local_vc_end, peer_vc_end)?;

        // Step 3: subscribe with the multicast manager.
        let subscribe_result = manager.subscribe(reduced_feed, peer_addr).await;
        if let Err(ManagerError::Noent) = &subscribe_result {
            tracing::info!(feed = reduced_feed, "multicast manager has no publisher for feed; replying NOENT");
            self.stats.handshakes_rejected_noent += 1;
            let _ = circuit.remove(&workgroup, &circuit_id);
            return Ok(SubscriptionReply::Noent);
        }
        let coordinates = subscribe_result.map_err(|e| {
            let _ = circuit.remove(&workgroup, &circuit_id);
            EngineError::from(e)
        })?;

        // Step 4: open the product-index map for the reduced feed.
        let index_map = match MmapIndexMap::open_for_reading(&self.index_map_dir, reduced_feed) {
            Ok(m) => m,
            Err(e) => {
                let _ = manager.unsubscribe(reduced_feed, coordinates.fmtp_client_addr).await;
                let _ = circuit.remove(&workgroup, &circuit_id);
                return Err(EngineError::from(e));
            }
        };

        // Step 5: record session state.
        self.feed = reduced_feed;
        self.down_fmtp_addr = Some(coordinates.fmtp_client_addr);
        self.vc_handle = Some(circuit_id);
        self.vc_workgroup = Some(workgroup);
        self.index_map = Some(Box::new(index_map));

        // Step 6: open the product queue (once per process) and install
        // the client transport.
        if self.product_queue.is_none() {
            let pq = SqliteProductQueue::open(&self.product_queue_path)
                .map_err(|e| EngineError::System(e.to_string()))?;
            self.product_queue = Some(Box::new(pq));
        }

        self.stats.handshakes_accepted += 1;

        Ok(SubscriptionReply::Ok { coordinates })
    }

    /// Releases the multicast-manager allocation and virtual circuit, in
    /// that order (the reverse of acquisition order in `handshake`).
    /// Idempotent: safe to call on a session that never subscribed, and
    /// safe to call more than once. Always marks the session done.
    ///
    /// This plays the role a process-exit termination hook would in a
    /// synchronous runtime; here it is an explicit step the dispatcher
    /// takes after `run_session` returns, rather than a destructor,
    /// because releasing the manager allocation is an async operation
    /// and `Drop` cannot await it.
    pub async fn teardown(&mut self, manager: &dyn MulticastManagerClient, circuit: &mut dyn CircuitProvisioner) {
        if self.feed != NONE_FEED {
            if let Some(addr) = self.down_fmtp_addr.take() {
                if let Err(e) = manager.unsubscribe(self.feed, addr).await {
                    tracing::warn!(error = %e, feed = self.feed, "multicast manager unsubscribe failed during teardown");
                }
            }
            self.feed = NONE_FEED;
        }

        if let Some(circuit_id) = self.vc_handle.take() {
            let workgroup = self.vc_workgroup.take().unwrap_or_default();
            if let Err(e) = circuit.remove(&workgroup, &circuit_id) {
                tracing::warn!(error = %e, circuit_id = %circuit_id, "circuit removal failed during teardown");
            }
        }

        self.product_queue = None;
        self.index_map = None;
        self.done = true;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Releases the local, synchronous resources unconditionally. The
        // manager allocation and circuit are released by `teardown`,
        // which the dispatcher always awaits before dropping the
        // session; a circuit handle still present here means `teardown`
        // was skipped (e.g. a panic unwinding past it), which is worth a
        // log line since the peer-side resources then leak until the
        // manager's own liveness checks reclaim them.
        self.product_queue = None;
        self.index_map = None;

        if let Some(circuit_id) = self.vc_handle.take() {
            tracing::warn!(circuit_id = %circuit_id, "session dropped without releasing its circuit handle");
        }
    }
}
