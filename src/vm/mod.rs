//! Virtual machines of the lab.
//!
//! A [`VirtualMachine`] is built once from its resolved `VM.*` section and is
//! read-only afterwards, so lifecycle workers share it by reference.

pub mod commands;
pub mod platform;
pub mod prompts;

use crate::config::schema::{host_name, validate, validate_datastore_path, Param, ParamType, Schema, ValidationError};
use crate::config::ConfigError;
use crate::ip::{Alias, Interface, InterfaceError};
use crate::network::Network;
use log::{debug, warn};
use platform::{IfaceKind, NamingScheme, Platform};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Folder on the datastore holding the serial port pipes
pub const SERIAL_PORTS_DIR: &str = "serial_ports";

#[derive(Debug, Clone, Serialize)]
pub struct VirtualMachine {
    pub name: String,
    /// `<pool>_<name>`
    pub name_on_host: String,
    pub platform: Platform,

    pub memory_mb: u64,
    pub cpu_count: u32,
    /// Configured in MB, stored in KB
    pub disk_space_kb: u64,
    /// Installation image as a datastore path
    pub iso: Option<String>,
    /// VMs with `deploy: false` are never selected
    pub deploy: bool,

    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub default_gw: String,

    pub hostname: String,
    pub serial_dir: String,
    pub serial_path: String,
    pub iface_kind: IfaceKind,
    pub naming_scheme: NamingScheme,
    /// IPv4 address of `hw0`
    pub address: Option<Ipv4Addr>,

    /// Ordered by hardware index
    pub hardware: Vec<Interface>,
    pub loopbacks: Vec<Interface>,
    /// `hwN` keys and device names, both pointing into `hardware`
    #[serde(skip)]
    hardware_by_name: BTreeMap<String, usize>,

    /// Commands pushed after install
    pub configuration: Vec<String>,
    /// Commands pushed over the serial console before install; `None` for
    /// platforms configured only interactively
    pub configuration_commands: Option<Vec<String>>,
}

impl VirtualMachine {
    pub const SCHEMA: Schema = Schema {
        entity: "vm",
        params: &[
            Param::optional("iso", ParamType::Str),
            Param::optional("ifaces_naming", ParamType::Str),
            Param::optional("ifaces_type", ParamType::Str),
            Param::optional("hostname", ParamType::Str),
            Param::required("user", ParamType::Str),
            Param::required("password", ParamType::Str),
            Param::required("default_gw", ParamType::Str),
            Param::required("type", ParamType::Str),
            Param::required("memory", ParamType::Int),
            Param::required("cpu", ParamType::Int),
            Param::required("disk_space", ParamType::Int),
            Param::optional("deploy", ParamType::Bool),
            Param::required("ifaces", ParamType::Mapping),
            Param::optional_list("configuration", &[ParamType::Str]),
        ],
    };

    /// Build a VM from its resolved section.
    ///
    /// `net` values of the interface blocks that name one of `networks` are
    /// rewritten to the network's host name; anything else passes through.
    pub fn from_config(
        name: &str,
        pool: &str,
        datastore: &str,
        networks: &[Network],
        raw: &Mapping,
    ) -> Result<Self, ConfigError> {
        let section = format!("VM.{}", name);
        let invalid = |source: ValidationError| ConfigError::Validation {
            section: section.clone(),
            source,
        };
        let v = validate(&Self::SCHEMA, raw).map_err(invalid)?;

        let platform: Platform = v.string("type").map_err(invalid)?.parse().map_err(invalid)?;
        let memory_mb: u64 = positive(v.int("memory").map_err(invalid)?, "memory").map_err(invalid)?;
        let cpu_count: u32 = positive(v.int("cpu").map_err(invalid)?, "cpu").map_err(invalid)?;
        let disk_mb: u64 = positive(v.int("disk_space").map_err(invalid)?, "disk_space").map_err(invalid)?;

        let iface_kind = match v.opt_str("ifaces_type").map_err(invalid)? {
            Some(kind) => kind.parse().map_err(invalid)?,
            None => platform.default_iface_kind(cpu_count, memory_mb),
        };
        let naming_scheme = NamingScheme::from_option(v.opt_str("ifaces_naming").map_err(invalid)?.as_deref());

        let iso = v.opt_str("iso").map_err(invalid)?;
        if let Some(iso) = &iso {
            validate_datastore_path(iso).map_err(invalid)?;
        }

        let name_on_host = host_name(name, pool);
        let hostname = v
            .opt_str("hostname")
            .map_err(invalid)?
            .unwrap_or_else(|| name_on_host.clone())
            .replace('_', "-");
        let serial_dir = format!("/vmfs/volumes/{}/{}", datastore, SERIAL_PORTS_DIR);
        let serial_path = format!("{}/{}", serial_dir, name_on_host);

        let ifaces = v
            .opt_mapping("ifaces")
            .map_err(invalid)?
            .cloned()
            .unwrap_or_default();
        let (hardware, loopbacks) = build_interfaces(name, platform, iface_kind, naming_scheme, networks, &ifaces)?;

        let mut hardware_by_name = BTreeMap::new();
        for (pos, (key, iface)) in hardware.iter().enumerate() {
            hardware_by_name.insert(key.clone(), pos);
            hardware_by_name.insert(iface.name.clone(), pos);
        }
        let hardware: Vec<Interface> = hardware.into_iter().map(|(_, iface)| iface).collect();

        let primary = hardware_by_name
            .get("hw0")
            .map(|pos| &hardware[*pos])
            .ok_or_else(|| ConfigError::MissingPrimaryInterface(name.to_string()))?;
        let address = primary.v4.map(|b| b.address);

        let mut vm = Self {
            name: name.to_string(),
            name_on_host,
            platform,
            memory_mb,
            cpu_count,
            disk_space_kb: disk_mb * 1024,
            iso,
            deploy: v.opt_bool("deploy").map_err(invalid)?.unwrap_or(true),
            user: v.string("user").map_err(invalid)?,
            password: v.string("password").map_err(invalid)?,
            default_gw: v.string("default_gw").map_err(invalid)?,
            hostname,
            serial_dir,
            serial_path,
            iface_kind,
            naming_scheme,
            address,
            hardware,
            loopbacks,
            hardware_by_name,
            configuration: v.str_list("configuration").map_err(invalid)?,
            configuration_commands: None,
        };

        if platform.generates_boot_config() {
            let cmds = commands::boot_commands(&vm);
            debug!("Commands for VM {}\n{}\n========", vm.name, cmds.join("\n"));
            vm.configuration_commands = Some(cmds);
        }
        Ok(vm)
    }

    /// Hardware interface by `hwN` key or device name
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.hardware_by_name.get(name).map(|pos| &self.hardware[*pos])
    }

    /// VLAN `num` of the hardware interface `iface`
    pub fn vlan(&self, iface: &str, num: u16) -> Option<&Alias> {
        self.interface(iface).and_then(|i| i.vlan(num))
    }

    /// Host-qualified names of the networks the hardware interfaces attach to
    pub fn network_names(&self) -> Vec<String> {
        self.hardware.iter().filter_map(|i| i.network.clone()).collect()
    }

    /// `<address> <name_on_host>`, the line reported by `getctrladdr`
    pub fn ctrl_addr(&self) -> String {
        let addr = self.address.map(|a| a.to_string()).unwrap_or_else(|| "None".into());
        format!("{} {}", addr, self.name_on_host)
    }
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn positive<T: TryFrom<i64>>(value: i64, name: &str) -> Result<T, ValidationError> {
    T::try_from(value).ok().filter(|_| value > 0).ok_or_else(|| ValidationError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: "must be a positive number".into(),
    })
}

type KeyedInterface = (String, Interface);

/// Split the `ifaces` block into hardware (`hwN` mappings) and loopback
/// (`loN` strings) interfaces. Other keys are logged and skipped.
fn build_interfaces(
    vm: &str,
    platform: Platform,
    kind: IfaceKind,
    scheme: NamingScheme,
    networks: &[Network],
    ifaces: &Mapping,
) -> Result<(Vec<KeyedInterface>, Vec<Interface>), ConfigError> {
    let section = format!("VM.{}", vm);
    let mut hardware: Vec<(u32, KeyedInterface)> = Vec::new();
    let mut loopbacks: Vec<(String, Interface)> = Vec::new();
    let iface_err = |source: InterfaceError| ConfigError::Interface { vm: vm.to_string(), source };

    for (key, cfg) in ifaces {
        let Some(key) = key.as_str() else {
            warn!("{}: unexpected key {:?} in 'ifaces' block; ignored", vm, key);
            continue;
        };
        match (key, cfg) {
            (k, Value::Mapping(cfg)) if k.starts_with("hw") => {
                let index: u32 = k[2..].parse().map_err(|_| ConfigError::Validation {
                    section: section.clone(),
                    source: ValidationError::InvalidValue {
                        name: k.to_string(),
                        value: k.to_string(),
                        reason: "hardware interfaces are named hw<index>".into(),
                    },
                })?;
                let device = platform
                    .interface_name(index, kind, scheme)
                    .map_err(ConfigError::validation(&section))?;
                let network = cfg.get("net").and_then(net_name).map(|net| {
                    networks
                        .iter()
                        .find(|n| n.name == net)
                        .map_or(net.clone(), |n| n.name_on_host.clone())
                });
                let iface = Interface::hardware(&device, network, cfg).map_err(iface_err)?;
                hardware.push((index, (k.to_string(), iface)));
            }
            (k, Value::String(ips)) if k.starts_with("lo") => {
                loopbacks.push((k.to_string(), Interface::loopback(k, ips).map_err(iface_err)?));
            }
            _ => warn!("{}: unexpected key '{}' in 'ifaces' block; ignored", vm, key),
        }
    }

    hardware.sort_by_key(|(index, _)| *index);
    loopbacks.sort_by(|a, b| a.0.cmp(&b.0));
    Ok((
        hardware.into_iter().map(|(_, keyed)| keyed).collect(),
        loopbacks.into_iter().map(|(_, iface)| iface).collect(),
    ))
}

fn net_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
