// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer upstream session engine.
//!
//! One process of this crate's [`bin@upstream-sessiond`] binary serves
//! exactly one downstream subscriber of one data feed: it authenticates
//! and authorizes the subscription, ensures a multicast publisher
//! exists for the requested feed via a sibling manager process,
//! serves the peer's missed-product lookups and backlog replay
//! over a transport that turns bidirectional after the initial
//! handshake, and releases every acquired resource on every exit path.
//!
//! [`circuit`] provisions the layer-2 virtual circuit, [`index_map`]
//! resolves multicast sequence numbers to on-disk product signatures,
//! [`product_queue`] reads the local product store, [`manager_client`]
//! talks to the sibling multicast manager, [`transport`] carries the
//! framed RPC traffic, [`session`] owns the handshake and the session
//! state machine, and [`dispatch`] drives the missed-product and
//! backlog streams on top of it all.

pub mod circuit;
pub mod config;
pub mod dispatch;
pub mod index_map;
pub mod manager_client;
pub mod policy;
pub mod product_queue;
pub mod protocol;
pub mod session;
pub mod transport;

pub use circuit::{drop_startup_privilege, CircuitProvisioner, ScriptCircuitProvisioner};
pub use config::SessionEngineConfig;
pub use dispatch::{run_session, Dependencies};
pub use manager_client::{MulticastManagerClient, TcpManagerClient};
pub use policy::{FileBackedPolicyOracle, PolicyOracle};
pub use product_queue::{ProductQueue, SqliteProductQueue};
pub use session::{EngineError, Session};
