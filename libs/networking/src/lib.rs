//! Networking utilities for the platform.
//!
//! This library provides helpers for:
//! - CIDR parsing for IPv4 and IPv6 networks
//! - Caller allowlists that fail closed when unconfigured

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Address has bits set outside the prefix.
    #[error("host bits set in {0}")]
    HostBitsSet(String),
}

// ============================================================================
// CIDR networks
// ============================================================================

/// An IPv4 or IPv6 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpNetwork {
    V4 { address: Ipv4Addr, prefix_len: u8 },
    V6 { address: Ipv6Addr, prefix_len: u8 },
}

impl IpNetwork {
    /// Parse from CIDR notation (e.g., "10.0.0.0/8" or "2001:db8::/32").
    ///
    /// A bare address is a single-host network. The address must not have
    /// bits set beyond the prefix: "10.0.0.1/8" is rejected.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let max_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix_str {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| NetworkError::InvalidPrefix(p.to_string()))?,
            None => max_len,
        };

        if prefix_len > max_len {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max_len
            )));
        }

        let network = match address {
            IpAddr::V4(address) => IpNetwork::V4 {
                address,
                prefix_len,
            },
            IpAddr::V6(address) => IpNetwork::V6 {
                address,
                prefix_len,
            },
        };

        if network.masked() != network {
            return Err(NetworkError::HostBitsSet(s.to_string()));
        }

        Ok(network)
    }

    /// Prefix length of this network.
    pub fn prefix_len(&self) -> u8 {
        match self {
            IpNetwork::V4 { prefix_len, .. } | IpNetwork::V6 { prefix_len, .. } => *prefix_len,
        }
    }

    /// Check if an address is within this network.
    ///
    /// Addresses of the other family never match, except IPv4-mapped IPv6
    /// addresses which are compared as IPv4.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr.to_canonical()) {
            (
                IpNetwork::V4 {
                    address,
                    prefix_len,
                },
                IpAddr::V4(candidate),
            ) => mask_ipv4(candidate, *prefix_len) == *address,
            (
                IpNetwork::V6 {
                    address,
                    prefix_len,
                },
                IpAddr::V6(candidate),
            ) => mask_ipv6(candidate, *prefix_len) == *address,
            _ => false,
        }
    }

    fn masked(self) -> Self {
        match self {
            IpNetwork::V4 {
                address,
                prefix_len,
            } => IpNetwork::V4 {
                address: mask_ipv4(address, prefix_len),
                prefix_len,
            },
            IpNetwork::V6 {
                address,
                prefix_len,
            } => IpNetwork::V6 {
                address: mask_ipv6(address, prefix_len),
                prefix_len,
            },
        }
    }
}

impl FromStr for IpNetwork {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpNetwork::V4 {
                address,
                prefix_len,
            } => write!(f, "{}/{}", address, prefix_len),
            IpNetwork::V6 {
                address,
                prefix_len,
            } => write!(f, "{}/{}", address, prefix_len),
        }
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from((bits & mask).to_be_bytes())
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// Caller allowlist
// ============================================================================

/// The network range callers must originate from.
///
/// An unconfigured allowlist denies every caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllowedNetwork(Option<IpNetwork>);

impl AllowedNetwork {
    /// Allow callers from `network`.
    pub fn new(network: IpNetwork) -> Self {
        Self(Some(network))
    }

    /// Deny every caller.
    pub fn deny_all() -> Self {
        Self(None)
    }

    /// Build from an optional CIDR string.
    ///
    /// Returns the parse error alongside the deny-all allowlist so the caller
    /// can log it; an unparsable value never widens access.
    pub fn from_config(cidr: Option<&str>) -> (Self, Option<NetworkError>) {
        match cidr.map(IpNetwork::from_cidr) {
            Some(Ok(network)) => (Self::new(network), None),
            Some(Err(e)) => (Self::deny_all(), Some(e)),
            None => (Self::deny_all(), None),
        }
    }

    /// The configured network, if any.
    pub fn network(&self) -> Option<&IpNetwork> {
        self.0.as_ref()
    }

    /// Whether `addr` may call privileged endpoints.
    pub fn permits(&self, addr: IpAddr) -> bool {
        self.0.is_some_and(|network| network.contains(addr))
    }
}

impl std::fmt::Display for AllowedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(network) => write!(f, "{}", network),
            None => write!(f, "<deny-all>"),
        }
    }
}
