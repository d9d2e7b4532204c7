//! Compute backend: the host-side objects of a lab.
//!
//! The orchestrator never talks to the virtualization host directly; it goes
//! through [`ComputeBackend`]. [`esx_shell::EsxShellBackend`] drives a real
//! host with `esxcli`/`vim-cmd` over an SSH session, and
//! [`simulated::SimulatedBackend`] keeps the same objects in memory.
//!
//! Implementations must accept concurrent calls for independent objects;
//! lifecycle phases create and power VMs from one worker thread per VM.

pub mod esx_shell;
pub mod simulated;

use crate::session::SessionError;
use serde::Serialize;

pub use esx_shell::EsxShellBackend;
pub use simulated::SimulatedBackend;

/// Virtual hardware version of every lab VM
pub const HW_VERSION: u32 = 8;

/// Ports of a newly created vSwitch
pub const VSWITCH_PORTS: u32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// A VM references a port group that is not on the host
    #[error("Critical error! Network {0} is not exists")]
    MissingNetwork(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("host command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl BackendError {
    pub fn is_critical(&self) -> bool {
        matches!(self, BackendError::MissingNetwork(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, BackendError::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    fn not_found(kind: &'static str, name: &str) -> Self {
        BackendError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    fn already_exists(kind: &'static str, name: &str) -> Self {
        BackendError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }
}

/// Everything needed to create one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSpec {
    pub name: String,
    pub datastore: String,
    /// Datastore path of the installation image
    pub iso: Option<String>,
    /// Resource pool name, `/` for the host's root pool
    pub resource_pool: String,
    /// Port groups, one virtual NIC each, in order
    pub networks: Vec<String>,
    pub memory_mb: u64,
    pub cpu_count: u32,
    /// 0 means no disk
    pub disk_kb: u64,
    /// Named pipe backing the first serial port
    pub serial_path: Option<String>,
    pub hw_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortGroupSpec {
    pub name: String,
    pub vswitch: String,
    pub promiscuous: bool,
    pub vlan_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerState {
    On,
    Off,
}

pub trait ComputeBackend: Send + Sync {
    /// Re-establish the control connection
    fn reconnect(&self) -> Result<(), BackendError>;

    fn list_vms(&self) -> Result<Vec<String>, BackendError>;

    fn vm_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.list_vms()?.iter().any(|vm| vm == name))
    }

    /// Fails with [`BackendError::MissingNetwork`] when a network of `spec`
    /// has no port group on the host
    fn create_vm(&self, spec: &VmSpec) -> Result<(), BackendError>;

    /// Powers the VM off first; a missing VM is not an error
    fn destroy_vm(&self, name: &str) -> Result<(), BackendError>;

    /// Returns once the VM reports powered on, or with
    /// [`BackendError::Timeout`]
    fn power_on_vm(&self, name: &str) -> Result<(), BackendError>;

    fn power_off_vm(&self, name: &str) -> Result<(), BackendError>;

    fn reset_vm(&self, name: &str) -> Result<(), BackendError>;

    /// Powers the VM off and disconnects its CD-ROM image
    fn detach_iso(&self, name: &str) -> Result<(), BackendError>;

    fn pool_exists(&self, name: &str) -> Result<bool, BackendError>;

    fn create_pool(&self, name: &str) -> Result<(), BackendError>;

    /// A missing pool is not an error
    fn destroy_pool(&self, name: &str) -> Result<(), BackendError>;

    fn vswitch_exists(&self, name: &str) -> Result<bool, BackendError>;

    fn create_vswitch(&self, name: &str, ports: u32) -> Result<(), BackendError>;

    /// Removes the switch with its port groups; a missing switch is not an error
    fn destroy_vswitch(&self, name: &str) -> Result<(), BackendError>;

    fn portgroup_exists(&self, name: &str) -> Result<bool, BackendError>;

    fn create_portgroup(&self, spec: &PortGroupSpec) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_network_is_critical() {
        let err = BackendError::MissingNetwork("lab_mgmt".into());
        assert!(err.is_critical());
        assert!(err.to_string().starts_with("Critical error!"));
        assert!(!BackendError::not_found("VM", "lab_r1").is_critical());
    }
}
