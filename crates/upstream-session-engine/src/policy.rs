// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-validation policy oracle.
//!
//! The engine never implements authorization itself; it queries an oracle
//! for the set of feeds a peer address is allowed to subscribe to and
//! intersects that with the request. The production oracle's backing
//! store is a flat allow-list file, out of scope as a storage format --
//! only the query API below is consumed. The file is reloaded on every
//! lookup so operators can edit it without restarting the engine.

use crate::protocol::FeedMask;
use std::net::IpAddr;
use std::path::PathBuf;

/// Errors reading or parsing the policy source.
#[derive(Debug)]
pub enum PolicyError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error reading policy file: {}", s),
            Self::Parse(s) => write!(f, "malformed policy file: {}", s),
        }
    }
}

impl std::error::Error for PolicyError {}

/// Abstraction over peer authorization, consumed by the handshake.
pub trait PolicyOracle: Send + Sync {
    fn allowed_feeds(&self, peer_addr: IpAddr) -> Result<FeedMask, PolicyError>;
}

/// Production oracle: a flat text allow-list, one rule per line, reloaded
/// from disk on every call.
///
/// Line format: `<ip-or-cidr> <hex-feed-mask>`, e.g. `10.0.0.0/24 0x0f`.
/// Blank lines and lines starting with `#` are ignored. The first
/// matching rule wins; an unmatched peer is allowed nothing.
pub struct FileBackedPolicyOracle {
    path: PathBuf,
}

impl FileBackedPolicyOracle {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn parse(contents: &str) -> Result<Vec<(CidrRule, FeedMask)>, PolicyError> {
        let mut rules = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let cidr_str = parts
                .next()
                .ok_or_else(|| PolicyError::Parse(format!("line {}: missing CIDR", lineno + 1)))?;
            let mask_str = parts
                .next()
                .ok_or_else(|| PolicyError::Parse(format!("line {}: missing feed mask", lineno + 1)))?;

            let rule = CidrRule::parse(cidr_str)
                .map_err(|e| PolicyError::Parse(format!("line {}: {}", lineno + 1, e)))?;
            let mask = parse_hex_mask(mask_str)
                .map_err(|e| PolicyError::Parse(format!("line {}: {}", lineno + 1, e)))?;

            rules.push((rule, mask));
        }
        Ok(rules)
    }
}

impl PolicyOracle for FileBackedPolicyOracle {
    fn allowed_feeds(&self, peer_addr: IpAddr) -> Result<FeedMask, PolicyError> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| PolicyError::Io(format!("{}: {}", self.path.display(), e)))?;
        let rules = Self::parse(&contents)?;

        for (rule, mask) in &rules {
            if rule.contains(peer_addr) {
                return Ok(*mask);
            }
        }
        Ok(0)
    }
}

fn parse_hex_mask(s: &str) -> Result<FeedMask, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(s, 16).map_err(|e| format!("invalid feed mask {:?}: {}", s, e))
}

/// A parsed `ip` or `ip/prefix_len` rule.
struct CidrRule {
    network: IpAddr,
    prefix_len: u32,
}

impl CidrRule {
    fn parse(s: &str) -> Result<Self, String> {
        match s.split_once('/') {
            Some((ip, prefix)) => {
                let network: IpAddr = ip.parse().map_err(|_| format!("invalid address {:?}", ip))?;
                let prefix_len: u32 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix length {:?}", prefix))?;
                Ok(Self {
                    network,
                    prefix_len,
                })
            }
            None => {
                let network: IpAddr = s.parse().map_err(|_| format!("invalid address {:?}", s))?;
                let prefix_len = match network {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                Ok(Self {
                    network,
                    prefix_len,
                })
            }
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let net_bits = u32::from(net);
                let addr_bits = u32::from(a);
                let mask = mask_for_u32(self.prefix_len);
                net_bits & mask == addr_bits & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let net_bits = u128::from(net);
                let addr_bits = u128::from(a);
                let mask = mask_for_u128(self.prefix_len);
                net_bits & mask == addr_bits & mask
            }
            _ => false,
        }
    }
}

fn mask_for_u32(prefix_len: u32) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

fn mask_for_u128(prefix_len: u32) -> u128 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_policy(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn exact_host_match_returns_its_mask() {
        let file = write_policy("10.0.0.5 0x0f\n");
        let oracle = FileBackedPolicyOracle::new(file.path().to_path_buf());
        let mask = oracle.allowed_feeds("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(mask, 0x0f);
    }

    #[test]
    fn cidr_match_returns_its_mask() {
        let file = write_policy("10.0.0.0/24 0x03\n");
        let oracle = FileBackedPolicyOracle::new(file.path().to_path_buf());
        let mask = oracle.allowed_feeds("10.0.0.200".parse().unwrap()).unwrap();
        assert_eq!(mask, 0x03);

        let mask = oracle.allowed_feeds("10.0.1.1".parse().unwrap()).unwrap();
        assert_eq!(mask, 0);
    }

    #[test]
    fn unmatched_peer_is_allowed_nothing() {
        let file = write_policy("# comment only\n\n");
        let oracle = FileBackedPolicyOracle::new(file.path().to_path_buf());
        let mask = oracle.allowed_feeds("192.168.1.1".parse().unwrap()).unwrap();
        assert_eq!(mask, 0);
    }

    #[test]
    fn ipv6_cidr_match_with_prefix_over_32_bits() {
        let file = write_policy("2001:db8::/64 0x02\n");
        let oracle = FileBackedPolicyOracle::new(file.path().to_path_buf());
        let mask = oracle.allowed_feeds("2001:db8::1".parse().unwrap()).unwrap();
        assert_eq!(mask, 0x02);

        let mask = oracle.allowed_feeds("2001:db8:1::1".parse().unwrap()).unwrap();
        assert_eq!(mask, 0);
    }

    #[test]
    fn first_matching_rule_wins() {
        let file = write_policy("10.0.0.0/24 0x01\n10.0.0.5 0xff\n");
        let oracle = FileBackedPolicyOracle::new(file.path().to_path_buf());
        let mask = oracle.allowed_feeds("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(mask, 0x01);
    }

    #[test]
    fn malformed_line_is_a_parse_error() {
        let file = write_policy("not-a-valid-rule\n");
        let oracle = FileBackedPolicyOracle::new(file.path().to_path_buf());
        let err = oracle.allowed_feeds("10.0.0.5".parse().unwrap()).unwrap_err();
        assert!(matches!(err, PolicyError::Parse(_)));
    }
}
