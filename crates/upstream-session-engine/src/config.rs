// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session engine configuration.

use crate::protocol::VcEndpoint;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Startup configuration for one engine instance, supplied by the parent
/// daemon at fork time either as a JSON file or as individual CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEngineConfig {
    /// This engine's own virtual-circuit endpoint.
    pub local_vc_end: VcEndpoint,

    /// Path to the read-only SQLite product queue.
    pub product_queue_path: PathBuf,

    /// Directory holding one memory-mapped index-map file per feed.
    pub index_map_dir: PathBuf,

    /// Interpreter used to run the circuit-provisioning script (e.g. `/bin/sh`).
    #[serde(default = "default_provisioner_interpreter")]
    pub provisioner_interpreter: String,

    /// Path to the circuit-provisioning script.
    pub provisioner_script: PathBuf,

    /// Address of the multicast manager process.
    pub manager_addr: SocketAddr,

    /// Path to the flat peer-validation policy allow-list file.
    pub policy_file: PathBuf,

    /// Maximum accepted wire frame size, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Handshake timeout, in seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Timeout for a single multicast-manager RPC, in seconds.
    #[serde(default = "default_manager_timeout_secs")]
    pub manager_timeout_secs: u64,
}

fn default_provisioner_interpreter() -> String {
    "/bin/sh".to_string()
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_manager_timeout_secs() -> u64 {
    5
}

impl SessionEngineConfig {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Saves configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn manager_timeout(&self) -> Duration {
        Duration::from_secs(self.manager_timeout_secs)
    }

    /// Validates configuration, rejecting values that would make the
    /// engine unable to do useful work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::InvalidValue("max_frame_size cannot be 0".into()));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "handshake_timeout_secs cannot be 0".into(),
            ));
        }
        if self.manager_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "manager_timeout_secs cannot be 0".into(),
            ));
        }
        if self.manager_addr.port() == 0 {
            return Err(ConfigError::InvalidValue("manager_addr port cannot be 0".into()));
        }
        if self.provisioner_interpreter.is_empty() {
            return Err(ConfigError::InvalidValue(
                "provisioner_interpreter cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Parse(s) => write!(f, "parse error: {}", s),
            Self::Serialize(s) => write!(f, "serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
