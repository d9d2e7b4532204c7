//! Building the lab model out of a [`SectionTree`].

use super::document::SectionTree;
use super::entities::{ControlPlane, EsxHost, FtpEndpoint, Settings, Timeouts};
use super::ConfigError;
use crate::network::Network;
use crate::vm::VirtualMachine;
use log::{debug, info};
use serde_yaml::Value;

/// Validated networks, VMs and lab-wide settings of one document
#[derive(Debug, Clone)]
pub struct TopologyReader {
    pub ftp: FtpEndpoint,
    pub esx: EsxHost,
    pub vcenter: ControlPlane,
    pub settings: Settings,
    pub timeouts: Timeouts,
    pub networks: Vec<Network>,
    pub vms: Vec<VirtualMachine>,
}

impl TopologyReader {
    /// Parse and validate a YAML document.
    ///
    /// `ifaces_naming`, when given, replaces the `ifaces_naming` value of every
    /// VM.
    pub fn from_str(yaml: &str, ifaces_naming: Option<&str>) -> Result<Self, ConfigError> {
        let tree = SectionTree::from_str(yaml)?;
        Self::from_tree(&tree, ifaces_naming)
    }

    pub fn from_tree(tree: &SectionTree, ifaces_naming: Option<&str>) -> Result<Self, ConfigError> {
        // Lab-wide sections are validated before any entity is built
        let ftp = FtpEndpoint::from_config(tree.reserved("ftp")?).map_err(ConfigError::validation("ftp"))?;
        let esx = EsxHost::from_config(tree.reserved("esx")?).map_err(ConfigError::validation("esx"))?;
        let vcenter =
            ControlPlane::from_config(tree.reserved("esx_vcenter")?).map_err(ConfigError::validation("esx_vcenter"))?;
        let settings = Settings::from_config(tree.reserved("settings")?).map_err(ConfigError::validation("settings"))?;

        let timeouts = match tree.timeouts() {
            None | Some(Value::Null) => Timeouts::default(),
            Some(value) => serde_yaml::from_value(value.clone()).map_err(ConfigError::Timeouts)?,
        };

        let pool = settings.pool_name.as_str();
        let mut networks = Vec::new();

        for section in tree.leaves("NET") {
            let name = leaf_name(section);
            let net = Network::from_config(name, pool, &tree.resolve(section))
                .map_err(ConfigError::validation(section))?;
            debug!("Network {} from section {}", net, section);
            networks.push(net);
        }

        // Networks listed in settings but never described get the group defaults
        let net_defaults = tree.reserved("NET")?;
        for name in &settings.networks {
            if networks.iter().any(|n| &n.name == name) {
                continue;
            }
            let net = Network::from_config(name, pool, net_defaults).map_err(ConfigError::validation("NET"))?;
            debug!("Network {} from settings", net);
            networks.push(net);
        }

        let mut vms = Vec::new();
        for section in tree.leaves("VM") {
            let mut cfg = tree.resolve(section);
            if let Some(naming) = ifaces_naming {
                cfg.insert(Value::from("ifaces_naming"), Value::from(naming));
            }
            let vm = VirtualMachine::from_config(leaf_name(section), pool, &esx.datastore, &networks, &cfg)?;
            vms.push(vm);
        }

        info!(
            "Topology '{}': {} networks, {} virtual machines",
            pool,
            networks.len(),
            vms.len()
        );

        Ok(Self {
            ftp,
            esx,
            vcenter,
            settings,
            timeouts,
            networks,
            vms,
        })
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn vm(&self, name: &str) -> Option<&VirtualMachine> {
        self.vms.iter().find(|vm| vm.name == name)
    }
}

fn leaf_name(section: &str) -> &str {
    section.rsplit('.').next().unwrap_or(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::platform::{IfaceKind, Platform};
    use std::time::Duration;

    const LAB: &str = r#"
ftp:
  ip: 10.0.0.5
  user: build
  password: secret
  source_folder: /srv/builds
  access: scp
  target: '[datastore1] lab/vyatta.iso'
esx:
  ip: 10.0.0.2
  user: root
  name: esx1
  password: secret
  datastore: datastore1
esx_vcenter:
  ip: 10.0.0.3
  user: admin
  password: secret
settings:
  networks: [mgmt]
  pool_name: lab
NET:
  promiscuous: true
VM:
  type: vyatta
  user: vyatta
  password: vyatta
  default_gw: 10.0.0.254
  memory: 2048
  cpu: 2
  disk_space: 4096
  configuration:
    - set system ntp server 10.0.0.1
NET.lan:
  isolated: false
VM.r1:
  ifaces:
    hw0:
      net: lan
      ips: 10.0.0.1/24
"#;

    #[test]
    fn test_reads_networks_and_vms() {
        let reader = TopologyReader::from_str(LAB, None).unwrap();

        assert_eq!(reader.networks.len(), 2);
        let lan = reader.network("lan").unwrap();
        assert_eq!(lan.name_on_host, "lab_lan");
        assert!(!lan.isolated);
        // settings network built from the NET group defaults
        let mgmt = reader.network("mgmt").unwrap();
        assert!(mgmt.promiscuous);

        assert_eq!(reader.vms.len(), 1);
        let vm = reader.vm("r1").unwrap();
        assert_eq!(vm.platform, Platform::Vyatta);
        assert_eq!(vm.iface_kind, IfaceKind::Dataplane);
        assert_eq!(vm.hardware[0].network.as_deref(), Some("lab_lan"));
        assert_eq!(vm.configuration, vec!["set system ntp server 10.0.0.1"]);
        assert_eq!(reader.timeouts, Timeouts::default());
    }

    #[test]
    fn test_naming_override_applies_to_every_vm() {
        let reader = TopologyReader::from_str(LAB, Some("old")).unwrap();
        assert_eq!(reader.vm("r1").unwrap().hardware[0].name, "dp0p160p1");
    }

    #[test]
    fn test_timeouts_section() {
        let yaml = format!("{}timeouts:\n  boot: 2m\n", LAB);
        let reader = TopologyReader::from_str(&yaml, None).unwrap();
        assert_eq!(reader.timeouts.boot, Duration::from_secs(120));

        let yaml = format!("{}timeouts:\n  bogus: 2m\n", LAB);
        assert!(matches!(
            TopologyReader::from_str(&yaml, None),
            Err(ConfigError::Timeouts(_))
        ));
    }

    #[test]
    fn test_invalid_lab_section_names_section() {
        let yaml = LAB.replace("  pool_name: lab\n", "");
        let err = TopologyReader::from_str(&yaml, None).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref section, .. } if section == "settings"));
    }

    #[test]
    fn test_unsupported_type() {
        let yaml = format!("{}VM.r2:\n  type: debian\n  ifaces:\n    hw0: {{net: lan}}\n", LAB);
        let err = TopologyReader::from_str(&yaml, None).unwrap_err();
        assert!(err.to_string().contains("debian"));
    }
}
