//! In-memory compute backend.
//!
//! Keeps pools, switches, port groups and VMs in a mutex-guarded state and
//! enforces the same existence rules as a real host. Every call is appended
//! to a journal so tests can assert on ordering.

use super::{BackendError, ComputeBackend, PortGroupSpec, PowerState, VmSpec};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// A VM as the simulated host sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedVm {
    pub spec: VmSpec,
    pub power: PowerState,
    pub iso_attached: bool,
    /// Number of times the VM was powered on or reset
    pub boots: u32,
}

#[derive(Debug, Default)]
struct HostState {
    datastores: BTreeSet<String>,
    pools: BTreeSet<String>,
    vswitches: BTreeMap<String, u32>,
    portgroups: BTreeMap<String, PortGroupSpec>,
    vms: BTreeMap<String, SimulatedVm>,
    broken: BTreeSet<String>,
    journal: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SimulatedBackend {
    state: Mutex<HostState>,
}

impl SimulatedBackend {
    /// A host that accepts any datastore
    pub fn new() -> Self {
        Self::default()
    }

    /// A host with exactly these datastores
    pub fn with_datastores<I, S>(datastores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::default();
        backend.lock().datastores = datastores.into_iter().map(Into::into).collect();
        backend
    }

    /// Make every operation on VM `name` fail
    pub fn break_vm(&self, name: &str) {
        self.lock().broken.insert(name.to_string());
    }

    pub fn vm(&self, name: &str) -> Option<SimulatedVm> {
        self.lock().vms.get(name).cloned()
    }

    pub fn pools(&self) -> Vec<String> {
        self.lock().pools.iter().cloned().collect()
    }

    pub fn vswitches(&self) -> Vec<String> {
        self.lock().vswitches.keys().cloned().collect()
    }

    pub fn portgroups(&self) -> Vec<PortGroupSpec> {
        self.lock().portgroups.values().cloned().collect()
    }

    /// Calls made so far, e.g. `"power_on lab_r1"`
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the state, record the call and refuse broken VMs
    fn enter(&self, call: &str, vm: &str) -> Result<MutexGuard<'_, HostState>, BackendError> {
        let mut state = self.lock();
        state.journal.push(format!("{} {}", call, vm));
        if state.broken.contains(vm) {
            return Err(BackendError::Command(format!("{} {}: simulated failure", call, vm)));
        }
        Ok(state)
    }
}

impl HostState {
    fn vm_mut(&mut self, name: &str) -> Result<&mut SimulatedVm, BackendError> {
        self.vms
            .get_mut(name)
            .ok_or_else(|| BackendError::not_found("VM", name))
    }
}

impl ComputeBackend for SimulatedBackend {
    fn reconnect(&self) -> Result<(), BackendError> {
        self.lock().journal.push("reconnect".into());
        Ok(())
    }

    fn list_vms(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.lock().vms.keys().cloned().collect())
    }

    fn create_vm(&self, spec: &VmSpec) -> Result<(), BackendError> {
        let mut state = self.enter("create_vm", &spec.name)?;
        if state.vms.contains_key(&spec.name) {
            return Err(BackendError::already_exists("VM", &spec.name));
        }
        if !state.datastores.is_empty() && !state.datastores.contains(&spec.datastore) {
            return Err(BackendError::not_found("Datastore", &spec.datastore));
        }
        if spec.resource_pool != "/" && !state.pools.contains(&spec.resource_pool) {
            return Err(BackendError::not_found("Resource pool", &spec.resource_pool));
        }
        if let Some(missing) = spec.networks.iter().find(|n| !state.portgroups.contains_key(*n)) {
            return Err(BackendError::MissingNetwork(missing.clone()));
        }
        debug!("Simulated host: VM {} created", spec.name);
        state.vms.insert(
            spec.name.clone(),
            SimulatedVm {
                spec: spec.clone(),
                power: PowerState::Off,
                iso_attached: spec.iso.is_some(),
                boots: 0,
            },
        );
        Ok(())
    }

    fn destroy_vm(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("destroy_vm", name)?;
        state.vms.remove(name);
        Ok(())
    }

    fn power_on_vm(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("power_on", name)?;
        let vm = state.vm_mut(name)?;
        if vm.power == PowerState::Off {
            vm.power = PowerState::On;
            vm.boots += 1;
        }
        Ok(())
    }

    fn power_off_vm(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("power_off", name)?;
        state.vm_mut(name)?.power = PowerState::Off;
        Ok(())
    }

    fn reset_vm(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("reset", name)?;
        let vm = state.vm_mut(name)?;
        vm.power = PowerState::On;
        vm.boots += 1;
        Ok(())
    }

    fn detach_iso(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("detach_iso", name)?;
        let vm = state.vm_mut(name)?;
        vm.power = PowerState::Off;
        vm.iso_attached = false;
        Ok(())
    }

    fn pool_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.lock().pools.contains(name))
    }

    fn create_pool(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("create_pool", name)?;
        if !state.pools.insert(name.to_string()) {
            return Err(BackendError::already_exists("Resource pool", name));
        }
        Ok(())
    }

    fn destroy_pool(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("destroy_pool", name)?;
        state.pools.remove(name);
        Ok(())
    }

    fn vswitch_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.lock().vswitches.contains_key(name))
    }

    fn create_vswitch(&self, name: &str, ports: u32) -> Result<(), BackendError> {
        let mut state = self.enter("create_vswitch", name)?;
        if state.vswitches.contains_key(name) {
            return Err(BackendError::already_exists("Switch", name));
        }
        state.vswitches.insert(name.to_string(), ports);
        Ok(())
    }

    fn destroy_vswitch(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.enter("destroy_vswitch", name)?;
        if state.vswitches.remove(name).is_some() {
            state.portgroups.retain(|_, pg| pg.vswitch != name);
        }
        Ok(())
    }

    fn portgroup_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.lock().portgroups.contains_key(name))
    }

    fn create_portgroup(&self, spec: &PortGroupSpec) -> Result<(), BackendError> {
        let mut state = self.enter("create_portgroup", &spec.name)?;
        if state.portgroups.contains_key(&spec.name) {
            return Err(BackendError::already_exists("PortGroup", &spec.name));
        }
        if !state.vswitches.contains_key(&spec.vswitch) {
            return Err(BackendError::not_found("Switch", &spec.vswitch));
        }
        state.portgroups.insert(spec.name.clone(), spec.clone());
        Ok(())
    }
}
