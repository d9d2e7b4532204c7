//! Address aliases.
//!
//! An [`Alias`] is the resolved form of a comma separated CIDR list such as
//! `"10.0.0.1/24, 2001:db8::1/64"`. It holds at most one IPv4 and one IPv6
//! binding and remembers the VLAN and interface it belongs to.

use ipnetwork::{IpNetwork, IpNetworkError, Ipv4Network, Ipv6Network};
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Errors produced while resolving address lists
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("'{literal}' is not a valid network address: {reason}")]
    Invalid { literal: String, reason: String },

    #[error("invalid prefix length in '{0}'")]
    InvalidPrefix(String),
}

impl AddressError {
    fn from_literal(literal: &str, source: IpNetworkError) -> Self {
        match source {
            IpNetworkError::InvalidPrefix => AddressError::InvalidPrefix(literal.to_string()),
            other => AddressError::Invalid {
                literal: literal.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// An IPv4 address with its network, prefix length and wildcard mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct V4Binding {
    pub address: Ipv4Addr,
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    /// Bitwise complement of the prefix mask (ACL style "wildcard")
    pub wildcard: Ipv4Addr,
}

impl From<Ipv4Network> for V4Binding {
    fn from(net: Ipv4Network) -> Self {
        Self {
            address: net.ip(),
            network: net.network(),
            prefix_len: net.prefix(),
            wildcard: !net.mask(),
        }
    }
}

impl V4Binding {
    /// `address/prefix_len`
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// An IPv6 address with its network and prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct V6Binding {
    pub address: Ipv6Addr,
    pub network: Ipv6Addr,
    pub prefix_len: u8,
}

impl From<Ipv6Network> for V6Binding {
    fn from(net: Ipv6Network) -> Self {
        Self {
            address: net.ip(),
            network: net.network(),
            prefix_len: net.prefix(),
        }
    }
}

impl V6Binding {
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// A single parsed CIDR literal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cidr {
    V4(V4Binding),
    V6(V6Binding),
}

/// Parse `addr/prefix` (or a bare address, meaning a host prefix)
pub fn parse_cidr(literal: &str) -> Result<Cidr, AddressError> {
    let trimmed = literal.trim();
    // IpNetwork::from_str folds every failure into InvalidAddr, so pick the
    // family first to keep prefix errors distinguishable.
    let net = if trimmed.contains(':') {
        Ipv6Network::from_str(trimmed).map(IpNetwork::V6)
    } else {
        Ipv4Network::from_str(trimmed).map(IpNetwork::V4)
    }
    .map_err(|e| AddressError::from_literal(literal, e))?;

    Ok(match net {
        IpNetwork::V4(v4) => Cidr::V4(v4.into()),
        IpNetwork::V6(v6) => Cidr::V6(v6.into()),
    })
}

/// Address bindings of one interface or VLAN sub-interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alias {
    /// Name of the interface owning these addresses
    pub owner: String,
    pub vlan_id: Option<u16>,
    pub v4: Option<V4Binding>,
    pub v6: Option<V6Binding>,
}

impl Alias {
    /// Resolve a comma separated list of CIDR literals.
    ///
    /// Empty segments are skipped, so `"10.0.0.1/24,"` and `""` are valid.
    /// When a family appears more than once the last literal wins.
    pub fn parse(ips: &str, vlan_id: Option<u16>, owner: &str) -> Result<Self, AddressError> {
        let mut alias = Alias {
            owner: owner.to_string(),
            vlan_id,
            v4: None,
            v6: None,
        };

        for segment in ips.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match parse_cidr(segment)? {
                Cidr::V4(binding) => alias.v4 = Some(binding),
                Cidr::V6(binding) => alias.v6 = Some(binding),
            }
        }

        Ok(alias)
    }

    /// True when neither family is bound
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vlan_id {
            Some(id) => write!(f, "{}.{}", self.owner, id),
            None => write!(f, "{}", self.owner),
        }
    }
}
