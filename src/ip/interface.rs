//! Router interfaces.
//!
//! An [`Interface`] groups the VLAN sub-interfaces configured under one
//! hardware or loopback interface and decides which address the interface
//! itself reports.

use super::alias::{AddressError, Alias, V4Binding, V6Binding};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::fmt;

/// Errors produced while building an interface from its configuration block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("interface {iface}: {source}")]
    Address {
        iface: String,
        #[source]
        source: AddressError,
    },

    #[error("interface {iface}: block '{key}' {reason}")]
    InvalidVlan {
        iface: String,
        key: String,
        reason: String,
    },

    #[error("interface {iface}: 'ips' must be a string")]
    InvalidIps { iface: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interface {
    /// Device name on the router, e.g. `eth0`, `dp0s160` or `lo`
    pub name: String,
    /// Port group the interface is attached to (host qualified)
    pub network: Option<String>,
    /// VLAN sub-interfaces, ordered by their `vlanN` key
    pub vlans: Vec<Alias>,
    /// False when the address is inherited from the only VLAN
    pub owns_ip: bool,
    /// VLAN the effective address was inherited from
    pub inherited_vlan: Option<u16>,
    pub v4: Option<V4Binding>,
    pub v6: Option<V6Binding>,
}

impl Interface {
    /// Build a hardware interface from its `hwN` block.
    ///
    /// Recognised keys are `ips` (comma separated CIDR list) and any number of
    /// `vlanN: {num, ips}` blocks. The caller resolves `net` beforehand.
    pub fn hardware(name: &str, network: Option<String>, cfg: &Mapping) -> Result<Self, InterfaceError> {
        let mut vlan_keys: Vec<&str> = cfg
            .keys()
            .filter_map(Value::as_str)
            .filter(|k| k.starts_with("vlan"))
            .collect();
        vlan_keys.sort_unstable();

        let mut vlans = Vec::with_capacity(vlan_keys.len());
        for key in vlan_keys {
            vlans.push(parse_vlan_block(name, key, cfg.get(key).unwrap_or(&Value::Null))?);
        }

        let ips = match cfg.get("ips") {
            None | Some(Value::Null) => "",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(InterfaceError::InvalidIps { iface: name.to_string() }),
        };
        let own = Alias::parse(ips, None, name).map_err(|source| InterfaceError::Address {
            iface: name.to_string(),
            source,
        })?;

        Ok(Self::resolve(name, network, vlans, own))
    }

    /// Build a loopback interface from a plain address list
    pub fn loopback(name: &str, ips: &str) -> Result<Self, InterfaceError> {
        let own = Alias::parse(ips, None, name).map_err(|source| InterfaceError::Address {
            iface: name.to_string(),
            source,
        })?;
        Ok(Self::resolve(name, None, Vec::new(), own))
    }

    fn resolve(name: &str, network: Option<String>, vlans: Vec<Alias>, own: Alias) -> Self {
        // A lone VLAN lends its address to an interface that has none
        let inherit = own.is_empty() && vlans.len() == 1;
        let (owns_ip, inherited_vlan, v4, v6) = if inherit {
            let vlan = &vlans[0];
            (false, vlan.vlan_id, vlan.v4, vlan.v6)
        } else {
            (true, None, own.v4, own.v6)
        };

        Self {
            name: name.to_string(),
            network,
            vlans,
            owns_ip,
            inherited_vlan,
            v4,
            v6,
        }
    }

    /// Look up a VLAN sub-interface by its number
    pub fn vlan(&self, num: u16) -> Option<&Alias> {
        self.vlans.iter().find(|v| v.vlan_id == Some(num))
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn parse_vlan_block(iface: &str, key: &str, block: &Value) -> Result<Alias, InterfaceError> {
    let invalid = |reason: &str| InterfaceError::InvalidVlan {
        iface: iface.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let block = block.as_mapping().ok_or_else(|| invalid("must be a mapping"))?;
    let num = match block.get("num") {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid("needs an integer 'num'"))?;

    let ips = match block.get("ips") {
        None | Some(Value::Null) => "",
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err(invalid("has a non-string 'ips'")),
    };

    Alias::parse(ips, Some(num), iface).map_err(|source| InterfaceError::Address {
        iface: iface.to_string(),
        source,
    })
}
