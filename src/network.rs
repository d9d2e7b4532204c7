//! Lab networks (port groups on the ESX host).

use crate::config::schema::{host_name, validate, Param, ParamType, Schema, ValidationError};
use serde::Serialize;
use serde_yaml::Mapping;
use std::fmt;

/// VLAN id meaning "all VLANs" (trunk port group)
pub const TRUNK_VLAN: u16 = 4095;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub name: String,
    /// `<pool>_<name>`; the port group (and, if isolated, vSwitch) name
    pub name_on_host: String,
    /// Isolated networks get a vSwitch of their own
    pub isolated: bool,
    pub promiscuous: bool,
    pub vlan_id: u16,
}

impl Network {
    pub const SCHEMA: Schema = Schema {
        entity: "network",
        params: &[
            Param::optional("isolated", ParamType::Bool),
            Param::optional("promiscuous", ParamType::Bool),
            Param::optional("vlan", ParamType::Int),
        ],
    };

    pub fn from_config(name: &str, pool: &str, raw: &Mapping) -> Result<Self, ValidationError> {
        let v = validate(&Self::SCHEMA, raw)?;

        // 0 and absent both mean trunk
        let vlan_id = match v.opt_int("vlan")? {
            None | Some(0) => TRUNK_VLAN,
            Some(id) => u16::try_from(id)
                .ok()
                .filter(|id| *id <= TRUNK_VLAN)
                .ok_or_else(|| ValidationError::InvalidValue {
                    name: "vlan".into(),
                    value: id.to_string(),
                    reason: format!("VLAN id must be within 1..={}", TRUNK_VLAN),
                })?,
        };

        Ok(Self {
            name: name.to_string(),
            name_on_host: host_name(name, pool),
            isolated: v.opt_bool("isolated")?.unwrap_or(false),
            promiscuous: v.opt_bool("promiscuous")?.unwrap_or(false),
            vlan_id,
        })
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name_on_host)
    }
}
