//! Networking value types for the gateway.
//!
//! This library provides:
//! - `IpPrefix`: an IPv4 or IPv6 CIDR prefix, masked on construction
//! - host prefixes (`/32`, `/128`) for single addresses
//!
//! Prefixes serialize as CIDR strings so they can be used directly in
//! cloud API payloads (firewall source/destination lists).

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

/// An IPv4 or IPv6 address prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    /// Base address of the prefix (host bits cleared).
    address: IpAddr,

    /// Prefix length (e.g., 24 for /24).
    prefix_len: u8,
}

impl IpPrefix {
    /// Create a new prefix, masking the address to the prefix length.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(&address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// Prefix covering exactly one address (/32 for IPv4, /128 for IPv6).
    pub fn host(address: IpAddr) -> Self {
        Self {
            address,
            prefix_len: max_prefix_len(&address),
        }
    }

    /// Parse from CIDR notation (e.g., "10.0.0.0/24" or "2001:db8::/32").
    ///
    /// A bare address is accepted and treated as a host prefix.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            let address = IpAddr::from_str(s)
                .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
            return Ok(Self::host(address));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Base address of the prefix.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true if the prefix covers a single address.
    pub fn is_host(&self) -> bool {
        self.prefix_len == max_prefix_len(&self.address)
    }

    /// Check if an address is within this prefix.
    ///
    /// Addresses of the other family are never contained.
    pub fn contains(&self, addr: IpAddr) -> bool {
        if addr.is_ipv4() != self.address.is_ipv4() {
            return false;
        }
        mask(addr, self.prefix_len) == self.address
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl PartialOrd for IpPrefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IpPrefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then(self.prefix_len.cmp(&other.prefix_len))
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_cidr(&raw).map_err(serde::de::Error::custom)
    }
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 32 {
                u32::MAX
            } else {
                u32::MAX << (32 - prefix_len)
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 128 {
                u128::MAX
            } else {
                u128::MAX << (128 - prefix_len)
            };
            IpAddr::V6(Ipv6Addr::from((bits & mask).to_be_bytes()))
        }
    }
}
