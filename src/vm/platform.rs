//! Supported router platforms and their interface naming conventions.

use crate::config::schema::ValidationError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Router platform a VM runs, selected by the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Vyatta,
    Vyatta5400,
    Vyatta5600,
    Csr1000,
}

/// Behavioral family of a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Configured with pre-computed `set ...` commands over the serial console
    TextRouter,
    /// Driven only through the interactive configuration phase
    RoutingAppliance,
}

/// Interface driver family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IfaceKind {
    Ethernet,
    Dataplane,
}

/// Dataplane device naming convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingScheme {
    /// `dp0p<N>p1`
    Legacy,
    /// `dp0s<N>`
    #[default]
    Current,
}

/// Registry of supported `type` values
const REGISTRY: &[(&str, Platform)] = &[
    ("vyatta", Platform::Vyatta),
    ("vyatta5400", Platform::Vyatta5400),
    ("vyatta5600", Platform::Vyatta5600),
    ("csr1000", Platform::Csr1000),
];

impl FromStr for Platform {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        REGISTRY
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, platform)| *platform)
            .ok_or_else(|| ValidationError::UnsupportedVariant(s.to_string()))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = REGISTRY
            .iter()
            .find(|(_, p)| p == self)
            .map_or("unknown", |(name, _)| *name);
        f.write_str(name)
    }
}

impl Platform {
    pub fn family(self) -> Family {
        match self {
            Platform::Csr1000 => Family::RoutingAppliance,
            _ => Family::TextRouter,
        }
    }

    pub fn supports(self, kind: IfaceKind) -> bool {
        match kind {
            IfaceKind::Ethernet => true,
            IfaceKind::Dataplane => matches!(self, Platform::Vyatta | Platform::Vyatta5600),
        }
    }

    /// Interface kind used when the VM does not set `ifaces_type`.
    ///
    /// Dataplane-capable images switch to dataplane interfaces once the VM
    /// has more than one vCPU and at least 2GB of memory.
    pub fn default_iface_kind(self, cpu_count: u32, memory_mb: u64) -> IfaceKind {
        if self.supports(IfaceKind::Dataplane) && cpu_count > 1 && memory_mb >= 2048 {
            IfaceKind::Dataplane
        } else {
            IfaceKind::Ethernet
        }
    }

    /// Device name of the zero based hardware interface `index`
    pub fn interface_name(self, index: u32, kind: IfaceKind, scheme: NamingScheme) -> Result<String, ValidationError> {
        if !self.supports(kind) {
            return Err(ValidationError::UnsupportedInterfaceKind {
                platform: self.to_string(),
                kind: kind.to_string(),
            });
        }
        Ok(match kind {
            IfaceKind::Ethernet => format!("eth{}", index),
            IfaceKind::Dataplane => dataplane_name(index, scheme),
        })
    }

    /// True when the VM can be configured before install from generated text
    pub fn generates_boot_config(self) -> bool {
        self.family() == Family::TextRouter
    }

    /// True when the VM boots an installer that must write itself to disk
    pub fn installs_image(self) -> bool {
        self.family() == Family::TextRouter
    }
}

/// Map an interface index onto the hypervisor's PCI slot numbering.
///
/// Four ports share a slot stride of 32, so index 0..3 land on 160, 192,
/// 224, 256 and index 4 wraps to 161.
pub fn dataplane_name(index: u32, scheme: NamingScheme) -> String {
    let num = 160 + 32 * (index % 4) + index / 4;
    match scheme {
        NamingScheme::Legacy => format!("dp0p{}p1", num),
        NamingScheme::Current => format!("dp0s{}", num),
    }
}

impl FromStr for IfaceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ethernet" => Ok(IfaceKind::Ethernet),
            "dataplane" => Ok(IfaceKind::Dataplane),
            other => Err(ValidationError::InvalidValue {
                name: "ifaces_type".into(),
                value: other.to_string(),
                reason: "expected 'ethernet' or 'dataplane'".into(),
            }),
        }
    }
}

impl fmt::Display for IfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfaceKind::Ethernet => f.write_str("ethernet"),
            IfaceKind::Dataplane => f.write_str("dataplane"),
        }
    }
}

impl NamingScheme {
    /// `"old"` selects the legacy scheme, anything else the current one
    pub fn from_option(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("old") => NamingScheme::Legacy,
            _ => NamingScheme::Current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        assert_eq!("vyatta".parse::<Platform>().unwrap(), Platform::Vyatta);
        assert_eq!("Vyatta5600".parse::<Platform>().unwrap(), Platform::Vyatta5600);
        assert_eq!("CSR1000".parse::<Platform>().unwrap(), Platform::Csr1000);
        assert_eq!(
            "debian".parse::<Platform>(),
            Err(ValidationError::UnsupportedVariant("debian".into()))
        );
        assert_eq!(Platform::Vyatta5400.to_string(), "vyatta5400");
    }

    #[test]
    fn test_dataplane_mapping() {
        assert_eq!(dataplane_name(0, NamingScheme::Current), "dp0s160");
        assert_eq!(dataplane_name(0, NamingScheme::Legacy), "dp0p160p1");
        assert_eq!(dataplane_name(1, NamingScheme::Current), "dp0s192");
        assert_eq!(dataplane_name(3, NamingScheme::Current), "dp0s256");
        assert_eq!(dataplane_name(4, NamingScheme::Current), "dp0s161");
        assert_eq!(dataplane_name(9, NamingScheme::Legacy), "dp0p194p1");
        // pure: same input, same output
        assert_eq!(dataplane_name(7, NamingScheme::Current), dataplane_name(7, NamingScheme::Current));
    }

    #[test]
    fn test_interface_names_per_platform() {
        let v = Platform::Vyatta5600;
        assert_eq!(v.interface_name(2, IfaceKind::Ethernet, NamingScheme::Current).unwrap(), "eth2");
        assert_eq!(v.interface_name(2, IfaceKind::Dataplane, NamingScheme::Legacy).unwrap(), "dp0p224p1");

        assert!(matches!(
            Platform::Csr1000.interface_name(0, IfaceKind::Dataplane, NamingScheme::Current),
            Err(ValidationError::UnsupportedInterfaceKind { .. })
        ));
        assert!(Platform::Vyatta5400.interface_name(0, IfaceKind::Dataplane, NamingScheme::Current).is_err());
    }

    #[test]
    fn test_default_iface_kind() {
        assert_eq!(Platform::Vyatta.default_iface_kind(2, 2048), IfaceKind::Dataplane);
        assert_eq!(Platform::Vyatta.default_iface_kind(1, 4096), IfaceKind::Ethernet);
        assert_eq!(Platform::Vyatta.default_iface_kind(4, 1024), IfaceKind::Ethernet);
        assert_eq!(Platform::Vyatta5400.default_iface_kind(4, 4096), IfaceKind::Ethernet);
    }

    #[test]
    fn test_naming_scheme() {
        assert_eq!(NamingScheme::from_option(Some("old")), NamingScheme::Legacy);
        assert_eq!(NamingScheme::from_option(Some("new")), NamingScheme::Current);
        assert_eq!(NamingScheme::from_option(None), NamingScheme::Current);
    }

    #[test]
    fn test_families() {
        assert!(Platform::Vyatta5400.generates_boot_config());
        assert!(!Platform::Csr1000.generates_boot_config());
        assert!(!Platform::Csr1000.installs_image());
    }
}
