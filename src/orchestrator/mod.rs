//! Lab lifecycle orchestration.
//!
//! [`Topology`] owns the validated lab model and drives it through the
//! lifecycle: resource pool, switches and port groups, VMs, power, serial
//! console configuration, image install and teardown. Per-VM steps fan out
//! through [`TaskPool`]; phases run strictly one after another.
//!
//! The submodules add the console-driving steps ([`console`]), image
//! publishing ([`image`]) and client-side ssh conveniences ([`ssh`]).

pub mod console;
pub mod image;
pub mod ssh;

use crate::backend::{BackendError, ComputeBackend, PortGroupSpec, VmSpec, HW_VERSION, VSWITCH_PORTS};
use crate::config::{ControlPlane, EsxHost, FtpEndpoint, ImageAccess, Settings, Timeouts, TopologyReader};
use crate::network::Network;
use crate::pool::{PoolError, PoolReport, TaskPool};
use crate::probe::Prober;
use crate::session::{SessionError, SessionFactory};
use crate::vm::VirtualMachine;
use log::{debug, error, info};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("Could not find any host by filter '{0}'")]
    NoMatchingVms(String),

    #[error("{0}: not available!")]
    HostUnreachable(String),

    #[error("Lab not available! Unreachable: {}", .0.join(", "))]
    LabUnavailable(Vec<String>),

    #[error("Couldn't specify resource pool")]
    NoResourcePool,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A per-VM step failed on the console
    #[error("{vm}: {reason}")]
    Worker { vm: String, reason: String },

    #[error("Critical error! {0}")]
    Critical(String),

    #[error("Could not copy build {0}.")]
    CopyFailed(String),

    #[error("Could not create symlink {0}.")]
    SymlinkFailed(String),

    #[error("Couldn't get a build name; ls output: {0}")]
    IsoNotFound(String),

    #[error("Path '{0}' is not a datastore path")]
    NotADatastorePath(String),

    #[error("{}: no public key found", .0.display())]
    InvalidKey(PathBuf),

    #[error("Couldn't render the configuration report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LabError {
    /// Critical failures abort the run once the current phase has joined
    pub fn is_critical(&self) -> bool {
        match self {
            LabError::Backend(e) => e.is_critical(),
            LabError::Critical(_) => true,
            LabError::Pool(PoolError::Critical { .. }) => true,
            _ => false,
        }
    }

    fn worker(vm: &VirtualMachine, reason: impl Into<String>) -> Self {
        LabError::Worker {
            vm: vm.name_on_host.clone(),
            reason: reason.into(),
        }
    }
}

/// Run-wide switches
#[derive(Debug, Clone, Default)]
pub struct LabOptions {
    /// Case-insensitive VM name fragments; empty selects every VM
    pub vm_filter: Vec<String>,
    /// Create VMs in the host's root pool and never touch resource pools
    pub no_resource_pool: bool,
    /// Run per-VM tasks one after another
    pub single: bool,
    /// Overrides the `timeouts` section of the configuration
    pub timeouts: Option<Timeouts>,
}

/// External systems the lifecycle is driven against
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ComputeBackend>,
    pub sessions: Arc<dyn SessionFactory>,
    pub prober: Arc<dyn Prober>,
}

/// Post-install and boot-time commands of one VM, as printed by `getconfiguration`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmConfiguration {
    pub name: String,
    pub name_on_host: String,
    pub commands: Vec<String>,
}

impl fmt::Display for VmConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\n{}({})\n{}\n{}",
            self.name,
            self.name_on_host,
            "_".repeat(80),
            self.commands.join("\n")
        )
    }
}

pub struct Topology {
    pub ftp: FtpEndpoint,
    pub esx: EsxHost,
    pub vcenter: ControlPlane,
    pub settings: Settings,
    pub networks: Vec<Network>,
    /// Selected VMs only
    vms: Vec<VirtualMachine>,
    options: LabOptions,
    timeouts: Timeouts,
    backend: Arc<dyn ComputeBackend>,
    sessions: Arc<dyn SessionFactory>,
    prober: Arc<dyn Prober>,
}

impl Topology {
    pub fn new(reader: TopologyReader, options: LabOptions, collaborators: Collaborators) -> Result<Self, LabError> {
        let vms = select_vms(reader.vms, &options.vm_filter)?;
        debug!(
            "Selected VMs: {}",
            vms.iter().map(|vm| vm.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        let timeouts = options.timeouts.unwrap_or(reader.timeouts);
        Ok(Self {
            ftp: reader.ftp,
            esx: reader.esx,
            vcenter: reader.vcenter,
            settings: reader.settings,
            networks: reader.networks,
            vms,
            options,
            timeouts,
            backend: collaborators.backend,
            sessions: collaborators.sessions,
            prober: collaborators.prober,
        })
    }

    pub fn pool_name(&self) -> &str {
        &self.settings.pool_name
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// The selected VMs
    pub fn vms(&self) -> Vec<&VirtualMachine> {
        self.vms.iter().collect()
    }

    pub fn vm(&self, name: &str) -> Option<&VirtualMachine> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    fn phase(&self, name: &str) -> TaskPool<'_> {
        TaskPool::new(name).single(self.options.single)
    }

    /// Deploy the selected VMs from scratch.
    ///
    /// `iso` names the image in the FTP source folder; the newest one is
    /// used when absent.
    pub fn deploy(&self, iso: Option<&str>) -> Result<(), LabError> {
        let vms = self.vms();
        // Nothing is touched unless both hosts answer
        self.ping_hosts(&[self.esx.ip.as_str(), self.ftp.ip.as_str()])?;

        if !self.options.no_resource_pool {
            self.create_pool()?;
        }
        self.create_networks()?;

        // Refresh the image; VMs still booted from the old one must be off
        if !self.ftp.target.is_empty() {
            self.power_off(&vms, true)?;
            match self.ftp.access {
                ImageAccess::Scp => self.copy_build_via_scp(iso)?,
                ImageAccess::Nfs => self.create_symlink_to_iso(iso)?,
            }
        }

        // Recreate the VMs and boot them from the live image
        self.destroy_vms(&vms)?;
        self.create_vms(&vms)?;
        self.power_on(&vms, true, false)?;
        self.configure_and_install(&vms)?;

        // Second boot from disk without the image
        self.power_off(&vms, false)?;
        self.detach_iso(&vms)?;
        self.power_on(&vms, true, false)?;

        // Post-install configuration only for VMs that declare some
        let configured: Vec<&VirtualMachine> =
            vms.iter().copied().filter(|vm| !vm.configuration.is_empty()).collect();
        self.add_config(&configured)?;

        self.check_lab_availability(&vms)
    }

    /// Tear down VMs, switches and the resource pool
    pub fn destroy(&self) -> Result<(), LabError> {
        self.destroy_vms(&self.vms())?;
        self.destroy_networks()?;
        if !self.options.no_resource_pool {
            self.destroy_pool()?;
        }
        Ok(())
    }

    pub fn ping_hosts(&self, addrs: &[&str]) -> Result<(), LabError> {
        for addr in addrs {
            if !self.prober.is_reachable(addr) {
                return Err(LabError::HostUnreachable(addr.to_string()));
            }
            info!("{} is available", addr);
        }
        Ok(())
    }

    pub fn create_pool(&self) -> Result<(), LabError> {
        match self.backend.create_pool(self.pool_name()) {
            Ok(()) => info!("Resource pool {} created", self.pool_name()),
            Err(e) if e.is_already_exists() => debug!("{}", e),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn destroy_pool(&self) -> Result<(), LabError> {
        tolerate_missing(self.backend.destroy_pool(self.pool_name()))
    }

    /// One vSwitch named after the pool for the shared networks, one per
    /// isolated network, then a port group per network
    pub fn create_networks(&self) -> Result<PoolReport, LabError> {
        info!("Starting Networks creating process...");
        let (isolated, shared): (Vec<&Network>, Vec<&Network>) = self.networks.iter().partition(|n| n.isolated);

        let mut switches = self.phase("create vswitches");
        if !shared.is_empty() {
            let name = self.pool_name();
            switches.submit(name, move || tolerate_existing(self.backend.create_vswitch(name, VSWITCH_PORTS)));
        }
        for net in isolated.iter().copied() {
            let name = net.name_on_host.as_str();
            switches.submit(name, move || tolerate_existing(self.backend.create_vswitch(name, VSWITCH_PORTS)));
        }
        switches.join()?;

        let mut portgroups = self.phase("create port groups");
        let specs = shared
            .iter()
            .map(|net| port_group(net, self.pool_name()))
            .chain(isolated.iter().map(|net| port_group(net, &net.name_on_host)));
        for spec in specs {
            portgroups.submit(spec.name.clone(), move || {
                tolerate_existing(self.backend.create_portgroup(&spec))
            });
        }
        Ok(portgroups.join()?)
    }

    pub fn destroy_networks(&self) -> Result<PoolReport, LabError> {
        let mut pool = self.phase("destroy vswitches");
        if self.networks.iter().any(|n| !n.isolated) {
            let name = self.pool_name();
            pool.submit(name, move || tolerate_missing(self.backend.destroy_vswitch(name)));
        }
        for net in self.networks.iter().filter(|n| n.isolated) {
            let name = net.name_on_host.as_str();
            pool.submit(name, move || tolerate_missing(self.backend.destroy_vswitch(name)));
        }
        Ok(pool.join()?)
    }

    pub fn create_vms(&self, vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        info!("Starting VMs creating process...");
        let resource_pool = if self.backend.pool_exists(self.pool_name())? {
            self.pool_name().to_string()
        } else if self.options.no_resource_pool {
            "/".to_string()
        } else {
            return Err(LabError::NoResourcePool);
        };

        let mut pool = self.phase("create vms");
        for &vm in vms {
            let spec = self.vm_spec(vm, &resource_pool);
            pool.submit(&vm.name_on_host, move || Ok(self.backend.create_vm(&spec)?));
        }
        Ok(pool.join()?)
    }

    fn vm_spec(&self, vm: &VirtualMachine, resource_pool: &str) -> VmSpec {
        VmSpec {
            name: vm.name_on_host.clone(),
            datastore: self.esx.datastore.clone(),
            iso: vm.iso.clone(),
            resource_pool: resource_pool.to_string(),
            networks: vm.network_names(),
            memory_mb: vm.memory_mb,
            cpu_count: vm.cpu_count,
            disk_kb: vm.disk_space_kb,
            serial_path: Some(vm.serial_path.clone()),
            hw_version: HW_VERSION,
        }
    }

    pub fn destroy_vms(&self, vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        info!("Starting VMs destroying process...");
        let mut pool = self.phase("destroy vms");
        for &vm in vms {
            pool.submit(&vm.name_on_host, move || tolerate_missing(self.backend.destroy_vm(&vm.name_on_host)));
        }
        let report = pool.join()?;
        info!("VMs are destroyed.");
        Ok(report)
    }

    /// Power VMs on; with `boot_wait` each worker also waits on the serial
    /// console until the VM has booted
    pub fn power_on(&self, vms: &[&VirtualMachine], boot_wait: bool, ignore_missing: bool) -> Result<PoolReport, LabError> {
        info!("Starting turning power on process...");
        if boot_wait {
            info!("Starting VMs booting process. Timeout is {:?}", self.timeouts.boot);
        }
        let mut pool = self.phase("power on");
        for &vm in vms {
            if boot_wait {
                info!("VM {} is booting..", vm.name_on_host);
                pool.submit(&vm.name_on_host, move || self.power_on_and_wait_for_boot(vm));
            } else {
                pool.submit(&vm.name_on_host, move || {
                    ignoring_missing(self.backend.power_on_vm(&vm.name_on_host), ignore_missing)
                });
            }
        }
        let report = pool.join()?;
        info!("VMs' power is turned on.");
        Ok(report)
    }

    pub fn power_off(&self, vms: &[&VirtualMachine], ignore_missing: bool) -> Result<PoolReport, LabError> {
        info!("Starting turning power off process...");
        let mut pool = self.phase("power off");
        for &vm in vms {
            pool.submit(&vm.name_on_host, move || {
                ignoring_missing(self.backend.power_off_vm(&vm.name_on_host), ignore_missing)
            });
        }
        let report = pool.join()?;
        info!("VMs power is turned off.");
        Ok(report)
    }

    pub fn reset_vms(&self, vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        self.power_off(vms, false)?;
        self.power_on(vms, true, false)
    }

    /// Soft reboot from the console
    pub fn reboot_vms(&self, vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        info!("Staring soft-reboot process...");
        let mut pool = self.phase("reboot");
        for &vm in vms {
            pool.submit(&vm.name_on_host, move || self.reboot_vm(vm));
        }
        let report = pool.join()?;
        info!("VMs are booted");
        Ok(report)
    }

    pub fn detach_iso(&self, vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        let mut pool = self.phase("detach iso");
        for &vm in vms {
            pool.submit(&vm.name_on_host, move || Ok(self.backend.detach_iso(&vm.name_on_host)?));
        }
        let report = pool.join()?;
        info!("The .iso image was unmounted from all VMs");
        Ok(report)
    }

    /// Push the boot configuration over the serial console, then install
    /// the image to disk
    pub fn configure_and_install(&self, vms: &[&VirtualMachine]) -> Result<(), LabError> {
        info!("Starting installation process...");

        let mut configure = self.phase("boot configuration");
        for &vm in vms {
            if let Some(commands) = &vm.configuration_commands {
                configure.submit(&vm.name_on_host, move || self.send_via_serial(vm, commands).map(|_| ()));
            }
        }
        configure.join()?;

        let mut install = self.phase("install");
        for &vm in vms.iter().filter(|vm| vm.platform.installs_image()) {
            install.submit(&vm.name_on_host, move || self.install_image(vm));
        }
        install.join()?;

        info!("End of installation process");
        Ok(())
    }

    /// Push the post-install configuration of every selected VM
    pub fn configure(&self) -> Result<PoolReport, LabError> {
        info!("Starting configuring process...");
        let report = self.add_config(&self.vms())?;
        info!("End of configuring process");
        Ok(report)
    }

    /// Push the post-install configuration of the VMs that have one
    pub fn add_config(&self, vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        let mut pool = self.phase("configuration");
        for &vm in vms.iter().filter(|vm| !vm.configuration.is_empty()) {
            pool.submit(&vm.name_on_host, move || self.send_via_serial(vm, &vm.configuration).map(|_| ()));
        }
        Ok(pool.join()?)
    }

    pub fn check_lab_availability(&self, vms: &[&VirtualMachine]) -> Result<(), LabError> {
        let mut down = Vec::new();
        for vm in vms {
            let reachable = vm
                .address
                .map(|addr| self.prober.is_reachable(&addr.to_string()))
                .unwrap_or(false);
            if !reachable {
                error!("{} is NOT available", vm.name_on_host);
                down.push(vm.name_on_host.clone());
            }
        }
        if !down.is_empty() {
            return Err(LabError::LabUnavailable(down));
        }
        info!("Lab {} is available!", self.pool_name());
        Ok(())
    }

    /// Install `.deb` packages; `http://` sources are fetched with `wget`,
    /// everything else with `scp` from the FTP host
    pub fn update_with_deb(&self, packages: &[String], vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        info!("Starting installing deb packages...");
        let mut pool = self.phase("update");
        for &vm in vms {
            pool.submit(&vm.name_on_host, move || self.install_deb(vm, packages));
        }
        let report = pool.join()?;
        info!("Deb packages were installed!");
        Ok(report)
    }

    pub fn get_configuration(&self, vms: &[&VirtualMachine]) -> Vec<VmConfiguration> {
        vms.iter()
            .map(|vm| VmConfiguration {
                name: vm.name.clone(),
                name_on_host: vm.name_on_host.clone(),
                commands: vm
                    .configuration
                    .iter()
                    .chain(vm.configuration_commands.iter().flatten())
                    .cloned()
                    .collect(),
            })
            .collect()
    }

    pub fn get_ctrl_addr(&self, vms: &[&VirtualMachine]) -> Vec<String> {
        vms.iter().map(|vm| vm.ctrl_addr()).collect()
    }
}

/// Keep VMs whose name contains any filter (case-insensitive) and that are
/// marked for deployment, in configuration order
fn select_vms(vms: Vec<VirtualMachine>, filters: &[String]) -> Result<Vec<VirtualMachine>, LabError> {
    let filters: Vec<String> = filters.iter().map(|f| f.to_lowercase()).collect();
    let selected: Vec<VirtualMachine> = vms
        .into_iter()
        .filter(|vm| {
            let name = vm.name.to_lowercase();
            filters.is_empty() || filters.iter().any(|f| name.contains(f.as_str()))
        })
        .filter(|vm| vm.deploy)
        .collect();
    if selected.is_empty() {
        return Err(LabError::NoMatchingVms(filters.join(", ")));
    }
    Ok(selected)
}

fn port_group(net: &Network, vswitch: &str) -> PortGroupSpec {
    PortGroupSpec {
        name: net.name_on_host.clone(),
        vswitch: vswitch.to_string(),
        promiscuous: net.promiscuous,
        vlan_id: net.vlan_id,
    }
}

fn tolerate_existing(result: Result<(), BackendError>) -> Result<(), LabError> {
    match result {
        Err(e) if e.is_already_exists() => {
            debug!("{}", e);
            Ok(())
        }
        other => Ok(other?),
    }
}

fn tolerate_missing(result: Result<(), BackendError>) -> Result<(), LabError> {
    ignoring_missing(result, true)
}

fn ignoring_missing(result: Result<(), BackendError>, ignore: bool) -> Result<(), LabError> {
    match result {
        Err(e) if ignore && e.is_not_found() => {
            debug!("{}", e);
            Ok(())
        }
        other => Ok(other?),
    }
}
