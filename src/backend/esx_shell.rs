//! Compute backend driving an ESXi host from its own shell.
//!
//! Every operation opens an SSH session to the host, runs `esxcli` or
//! `vim-cmd` commands and reads their exit status from a `__rc=<n>` marker
//! echoed after each command. VMs are created by writing a `.vmx` file,
//! allocating the disk with `vmkfstools` and registering the result.

use super::{BackendError, ComputeBackend, PortGroupSpec, VmSpec};
use crate::config::schema::datastore_fs_path;
use crate::config::{EsxHost, Timeouts};
use crate::session::{InteractiveSession, SessionFactory};
use log::{debug, trace};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

static EXIT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__rc=(\d+)").expect("Invalid exit marker regex"));

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct EsxShellBackend {
    esx: EsxHost,
    sessions: Arc<dyn SessionFactory>,
    timeouts: Timeouts,
}

/// One row of `vim-cmd vmsvc/getallvms`
#[derive(Debug, Clone, PartialEq, Eq)]
struct RegisteredVm {
    id: String,
    name: String,
    /// `[datastore] dir/name.vmx`
    vmx: String,
}

impl EsxShellBackend {
    pub fn new(esx: EsxHost, sessions: Arc<dyn SessionFactory>, timeouts: Timeouts) -> Self {
        Self { esx, sessions, timeouts }
    }

    fn open(&self) -> Result<Box<dyn InteractiveSession>, BackendError> {
        Ok(self
            .sessions
            .open(&self.esx.ip, &self.esx.user, &self.esx.password, self.timeouts.login)?)
    }

    /// Run `commands` in one session; fails on the first non-zero exit status
    fn run_all(&self, commands: &[String]) -> Result<Vec<String>, BackendError> {
        let mut session = self.open()?;
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            trace!("{} $ {}", self.esx.ip, command);
            session.send_line(&format!("{}; echo __rc=$?", command))?;
            let m = session.expect(std::slice::from_ref(&*EXIT_MARKER), self.timeouts.build)?;
            let output = strip_echo(&m.before, command);
            let rc = EXIT_MARKER
                .captures(&m.after)
                .and_then(|c| c[1].parse::<i32>().ok())
                .unwrap_or(-1);
            if rc != 0 {
                if let Err(e) = session.close() {
                    debug!("{}: closing session failed: {}", self.esx.ip, e);
                }
                return Err(BackendError::Command(format!(
                    "'{}' exited with {}: {}",
                    command,
                    rc,
                    output.trim()
                )));
            }
            outputs.push(output);
        }
        session.close()?;
        Ok(outputs)
    }

    fn run(&self, command: impl Into<String>) -> Result<String, BackendError> {
        Ok(self.run_all(&[command.into()])?.pop().unwrap_or_default())
    }

    fn registered(&self) -> Result<Vec<RegisteredVm>, BackendError> {
        Ok(parse_getallvms(&self.run("vim-cmd vmsvc/getallvms")?))
    }

    fn find(&self, name: &str) -> Result<RegisteredVm, BackendError> {
        self.registered()?
            .into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| BackendError::not_found("VM", name))
    }

    fn is_powered_on(&self, id: &str) -> Result<bool, BackendError> {
        let state = self.run(format!("vim-cmd vmsvc/power.getstate {}", id))?;
        Ok(state.contains("Powered on"))
    }

    fn wait_power(&self, name: &str, id: &str, on: bool) -> Result<(), BackendError> {
        let deadline = Instant::now() + self.timeouts.power_poll;
        loop {
            if self.is_powered_on(id)? == on {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let state = if on { "on" } else { "off" };
                return Err(BackendError::Timeout(format!("{} to power {}", name, state)));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn portgroups(&self) -> Result<Vec<String>, BackendError> {
        Ok(parse_portgroups(&self.run("esxcli network vswitch standard portgroup list")?))
    }

    fn pool_id(&self, name: &str) -> Result<Option<String>, BackendError> {
        Ok(parse_pools(&self.run("vim-cmd hostsvc/rsrc/ls ha-root-pool")?)
            .into_iter()
            .find(|(_, pool)| pool == name)
            .map(|(id, _)| id))
    }
}

impl ComputeBackend for EsxShellBackend {
    fn reconnect(&self) -> Result<(), BackendError> {
        self.run("true").map(|_| ())
    }

    fn list_vms(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.registered()?.into_iter().map(|vm| vm.name).collect())
    }

    fn create_vm(&self, spec: &VmSpec) -> Result<(), BackendError> {
        if self.vm_exists(&spec.name)? {
            return Err(BackendError::already_exists("VM", &spec.name));
        }
        // Datastore and every port group must exist before anything is written
        let datastore = format!("/vmfs/volumes/{}", spec.datastore);
        if self.run(format!("test -d '{}'", datastore)).is_err() {
            return Err(BackendError::not_found("Datastore", &spec.datastore));
        }
        let existing = self.portgroups()?;
        if let Some(missing) = spec.networks.iter().find(|n| !existing.contains(*n)) {
            return Err(BackendError::MissingNetwork(missing.clone()));
        }

        let dir = format!("{}/{}", datastore, spec.name);
        let vmx = format!("{}/{}.vmx", dir, spec.name);
        let quoted: Vec<String> = vmx_lines(spec).iter().map(|l| format!("'{}'", l)).collect();

        // Write the .vmx, then allocate a thin disk next to it
        let mut commands = vec![
            format!("mkdir -p '{}'", dir),
            format!("printf '%s\\n' {} > '{}'", quoted.join(" "), vmx),
        ];
        if spec.disk_kb > 0 {
            commands.push(format!(
                "vmkfstools -c {}k -d thin '{}/{}.vmdk'",
                spec.disk_kb, dir, spec.name
            ));
        }
        // Register into the resource pool, or the host root for "/"
        let register = if spec.resource_pool == "/" {
            format!("vim-cmd solo/registervm '{}' '{}'", vmx, spec.name)
        } else {
            let pool = self
                .pool_id(&spec.resource_pool)?
                .ok_or_else(|| BackendError::not_found("Resource pool", &spec.resource_pool))?;
            format!("vim-cmd solo/registervm '{}' '{}' {}", vmx, spec.name, pool)
        };
        commands.push(register);

        self.run_all(&commands)?;
        debug!("VM {} registered from {}", spec.name, vmx);
        Ok(())
    }

    fn destroy_vm(&self, name: &str) -> Result<(), BackendError> {
        let vm = match self.find(name) {
            Ok(vm) => vm,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if self.is_powered_on(&vm.id)? {
            self.run(format!("vim-cmd vmsvc/power.off {}", vm.id))?;
        }
        self.run(format!("vim-cmd vmsvc/destroy {}", vm.id))?;
        Ok(())
    }

    fn power_on_vm(&self, name: &str) -> Result<(), BackendError> {
        let vm = self.find(name)?;
        if !self.is_powered_on(&vm.id)? {
            self.run(format!("vim-cmd vmsvc/power.on {}", vm.id))?;
        }
        self.wait_power(name, &vm.id, true)
    }

    fn power_off_vm(&self, name: &str) -> Result<(), BackendError> {
        let vm = self.find(name)?;
        if self.is_powered_on(&vm.id)? {
            self.run(format!("vim-cmd vmsvc/power.off {}", vm.id))?;
        }
        self.wait_power(name, &vm.id, false)
    }

    fn reset_vm(&self, name: &str) -> Result<(), BackendError> {
        let vm = self.find(name)?;
        self.run(format!("vim-cmd vmsvc/power.reset {}", vm.id)).map(|_| ())
    }

    fn detach_iso(&self, name: &str) -> Result<(), BackendError> {
        self.power_off_vm(name)?;
        let vm = self.find(name)?;
        let vmx = datastore_fs_path(&vm.vmx)
            .ok_or_else(|| BackendError::Command(format!("unexpected vmx path '{}'", vm.vmx)))?;
        self.run_all(&[
            format!(
                "sed -i -e 's/^ide1:0.startConnected = .*/ide1:0.startConnected = \"FALSE\"/' \
                 -e 's/^ide1:0.present = .*/ide1:0.present = \"FALSE\"/' '{}'",
                vmx
            ),
            format!("vim-cmd vmsvc/reload {}", vm.id),
        ])?;
        Ok(())
    }

    fn pool_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.pool_id(name)?.is_some())
    }

    fn create_pool(&self, name: &str) -> Result<(), BackendError> {
        if self.pool_exists(name)? {
            return Err(BackendError::already_exists("Resource pool", name));
        }
        self.run(format!(
            "vim-cmd hostsvc/rsrc/create --cpu-min-expandable=true --cpu-shares=normal \
             --mem-min-expandable=true --mem-shares=normal ha-root-pool '{}'",
            name
        ))
        .map(|_| ())
    }

    fn destroy_pool(&self, name: &str) -> Result<(), BackendError> {
        match self.pool_id(name)? {
            Some(id) => self.run(format!("vim-cmd hostsvc/rsrc/destroy {}", id)).map(|_| ()),
            None => Ok(()),
        }
    }

    fn vswitch_exists(&self, name: &str) -> Result<bool, BackendError> {
        let listing = self.run("esxcli network vswitch standard list")?;
        Ok(parse_vswitches(&listing).iter().any(|sw| sw == name))
    }

    fn create_vswitch(&self, name: &str, ports: u32) -> Result<(), BackendError> {
        if self.vswitch_exists(name)? {
            return Err(BackendError::already_exists("Switch", name));
        }
        self.run(format!(
            "esxcli network vswitch standard add --vswitch-name='{}' --ports={}",
            name, ports
        ))
        .map(|_| ())
    }

    fn destroy_vswitch(&self, name: &str) -> Result<(), BackendError> {
        if !self.vswitch_exists(name)? {
            return Ok(());
        }
        self.run(format!("esxcli network vswitch standard remove --vswitch-name='{}'", name))
            .map(|_| ())
    }

    fn portgroup_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.portgroups()?.iter().any(|pg| pg == name))
    }

    fn create_portgroup(&self, spec: &PortGroupSpec) -> Result<(), BackendError> {
        if self.portgroup_exists(&spec.name)? {
            return Err(BackendError::already_exists("PortGroup", &spec.name));
        }
        let base = "esxcli network vswitch standard portgroup";
        self.run_all(&[
            format!(
                "{} add --portgroup-name='{}' --vswitch-name='{}'",
                base, spec.name, spec.vswitch
            ),
            format!("{} set --portgroup-name='{}' --vlan-id={}", base, spec.name, spec.vlan_id),
            format!(
                "{} policy security set --portgroup-name='{}' --allow-promiscuous={}",
                base, spec.name, spec.promiscuous
            ),
        ])?;
        Ok(())
    }
}

/// Drop the echoed command line from the output preceding the exit marker
fn strip_echo(before: &str, command: &str) -> String {
    let mut lines: Vec<&str> = before.lines().collect();
    if let Some(pos) = lines.iter().position(|l| l.contains(command)) {
        lines.drain(..=pos);
    }
    lines.join("\n")
}

/// `.vmx` contents for a new VM
fn vmx_lines(spec: &VmSpec) -> Vec<String> {
    let mut lines = vec![
        r#".encoding = "UTF-8""#.to_string(),
        r#"config.version = "8""#.to_string(),
        format!(r#"virtualHW.version = "{}""#, spec.hw_version),
        format!(r#"displayName = "{}""#, spec.name),
        r#"guestOS = "debian4""#.to_string(),
        format!(r#"memSize = "{}""#, spec.memory_mb),
        format!(r#"numvcpus = "{}""#, spec.cpu_count),
        format!(r#"cpuid.coresPerSocket = "{}""#, spec.cpu_count),
        r#"sched.cpu.max = "2000""#.to_string(),
        format!(r#"sched.mem.max = "{}""#, spec.memory_mb),
        r#"sched.swap.hostLocal = "enabled""#.to_string(),
    ];
    if spec.disk_kb > 0 {
        lines.extend([
            r#"scsi0.present = "TRUE""#.to_string(),
            r#"scsi0.virtualDev = "lsilogic""#.to_string(),
            r#"scsi0:0.present = "TRUE""#.to_string(),
            format!(r#"scsi0:0.fileName = "{}.vmdk""#, spec.name),
        ]);
    }
    if let Some(iso) = spec.iso.as_deref().and_then(datastore_fs_path) {
        lines.extend([
            r#"ide1:0.present = "TRUE""#.to_string(),
            r#"ide1:0.deviceType = "cdrom-image""#.to_string(),
            format!(r#"ide1:0.fileName = "{}""#, iso),
            r#"ide1:0.startConnected = "TRUE""#.to_string(),
        ]);
    }
    for (i, network) in spec.networks.iter().enumerate() {
        lines.extend([
            format!(r#"ethernet{}.present = "TRUE""#, i),
            format!(r#"ethernet{}.virtualDev = "vmxnet3""#, i),
            format!(r#"ethernet{}.networkName = "{}""#, i, network),
            format!(r#"ethernet{}.addressType = "generated""#, i),
        ]);
    }
    if let Some(pipe) = &spec.serial_path {
        lines.extend([
            r#"serial0.present = "TRUE""#.to_string(),
            r#"serial0.fileType = "pipe""#.to_string(),
            format!(r#"serial0.fileName = "{}""#, pipe),
            r#"serial0.pipe.endPoint = "server""#.to_string(),
            r#"serial0.yieldOnMsrRead = "TRUE""#.to_string(),
        ]);
    }
    lines
}

/// Rows of `vim-cmd vmsvc/getallvms`: `Vmid Name File Guest OS ...`
fn parse_getallvms(listing: &str) -> Vec<RegisteredVm> {
    listing
        .lines()
        .filter_map(|line| {
            let (id, rest) = line.trim().split_once(char::is_whitespace)?;
            if !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let file_start = rest.find('[')?;
            let name = rest[..file_start].trim().to_string();
            let file = &rest[file_start..];
            let vmx_end = file.find(".vmx")? + ".vmx".len();
            Some(RegisteredVm {
                id: id.to_string(),
                name,
                vmx: file[..vmx_end].to_string(),
            })
        })
        .collect()
}

/// Port group names from `esxcli network vswitch standard portgroup list`.
///
/// Names may contain spaces, so the first column is cut at the width of the
/// dashed rule under the header.
fn parse_portgroups(listing: &str) -> Vec<String> {
    let mut lines = listing.lines().skip_while(|line| !line.trim_start().starts_with("---"));
    let width = match lines.next() {
        Some(rule) => rule.trim().chars().take_while(|&c| c == '-').count(),
        None => return Vec::new(),
    };
    lines
        .map(|line| line.trim_start().chars().take(width).collect::<String>())
        .map(|name| name.trim_end().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Switch names from `esxcli network vswitch standard list`
fn parse_vswitches(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Name: "))
        .map(|name| name.trim().to_string())
        .collect()
}

/// `(id, name)` of the child pools listed by `vim-cmd hostsvc/rsrc/ls`
fn parse_pools(listing: &str) -> Vec<(String, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let (id, name) = line.trim().split_once(char::is_whitespace)?;
            id.starts_with("pool").then(|| (id.to_string(), name.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HW_VERSION;
    use crate::session::ScriptedSessions;

    fn esx() -> EsxHost {
        EsxHost {
            ip: "10.0.0.2".into(),
            user: "root".into(),
            name: "esx1".into(),
            password: "pw".into(),
            datastore: "datastore1".into(),
        }
    }

    fn spec() -> VmSpec {
        VmSpec {
            name: "lab_r1".into(),
            datastore: "datastore1".into(),
            iso: Some("[datastore1] lab/vyatta.iso".into()),
            resource_pool: "/".into(),
            networks: vec!["lab_mgmt".into(), "lab_data".into()],
            memory_mb: 2048,
            cpu_count: 2,
            disk_kb: 2048 * 1024,
            serial_path: Some("/vmfs/volumes/datastore1/serial_ports/lab_r1".into()),
            hw_version: HW_VERSION,
        }
    }

    const GETALLVMS: &str = "Vmid   Name      File                          Guest OS      Version   Annotation\n\
        12     lab_r1    [datastore1] lab_r1/lab_r1.vmx   debian4Guest  vmx-08\n\
        13     lab r2    [datastore1] lab r2/lab r2.vmx   debian4Guest  vmx-08\n";

    const PORTGROUPS: &str = "Name                Virtual Switch  Active Clients  VLAN ID\n\
        ------------------  --------------  --------------  -------\n\
        Management Network  vSwitch0                     1        0\n\
        VM Network          vSwitch0                     0        0\n\
        lab_mgmt            lab                          0     4095\n\
        my lab_mgmt         my lab                       0     4095\n";

    #[test]
    fn test_parse_getallvms() {
        let vms = parse_getallvms(GETALLVMS);
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].id, "12");
        assert_eq!(vms[0].name, "lab_r1");
        assert_eq!(vms[0].vmx, "[datastore1] lab_r1/lab_r1.vmx");
        assert_eq!(vms[1].name, "lab r2");
    }

    #[test]
    fn test_parse_listings() {
        assert_eq!(
            parse_portgroups(PORTGROUPS),
            vec!["Management Network", "VM Network", "lab_mgmt", "my lab_mgmt"]
        );
        assert!(parse_portgroups("").is_empty());
        let switches = "vSwitch0\n   Name: vSwitch0\n   Class: etherswitch\nlab\n   Name: lab\n";
        assert_eq!(parse_vswitches(switches), vec!["vSwitch0", "lab"]);
        assert_eq!(
            parse_pools("pool0 lab\npool1 other\n"),
            vec![("pool0".to_string(), "lab".to_string()), ("pool1".to_string(), "other".to_string())]
        );
    }

    #[test]
    fn test_vmx_lines() {
        let lines = vmx_lines(&spec());
        assert!(lines.contains(&r#"virtualHW.version = "8""#.to_string()));
        assert!(lines.contains(&r#"ethernet1.networkName = "lab_data""#.to_string()));
        assert!(lines.contains(&r#"ide1:0.fileName = "/vmfs/volumes/datastore1/lab/vyatta.iso""#.to_string()));
        assert!(lines.contains(&r#"serial0.fileName = "/vmfs/volumes/datastore1/serial_ports/lab_r1""#.to_string()));
    }

    fn shell(listing_for: fn(&str) -> Option<&'static str>) -> ScriptedSessions {
        ScriptedSessions::new(move |_, line| {
            let command = line.trim_end_matches("; echo __rc=$?");
            match listing_for(command) {
                Some(out) => format!("{}\n{}\n__rc=0\n~ # ", line, out),
                None => format!("{}\n__rc=1\n~ # ", line),
            }
        })
    }

    #[test]
    fn test_create_vm_with_missing_network_is_critical() {
        let sessions = shell(|cmd| match cmd {
            "vim-cmd vmsvc/getallvms" => Some(GETALLVMS),
            "esxcli network vswitch standard portgroup list" => Some(PORTGROUPS),
            _ => Some(""),
        });
        let backend = EsxShellBackend::new(esx(), Arc::new(sessions.clone()), Timeouts::immediate());
        let mut vm = spec();
        vm.name = "lab_r3".into();
        let err = backend.create_vm(&vm).unwrap_err();
        assert!(matches!(err, BackendError::MissingNetwork(ref n) if n == "lab_data"));
    }

    #[test]
    fn test_create_vm_registers() {
        let sessions = shell(|cmd| match cmd {
            "vim-cmd vmsvc/getallvms" => Some(GETALLVMS),
            "esxcli network vswitch standard portgroup list" => Some(PORTGROUPS),
            _ => Some(""),
        });
        let backend = EsxShellBackend::new(esx(), Arc::new(sessions.clone()), Timeouts::immediate());
        let mut vm = spec();
        vm.name = "lab_r3".into();
        vm.networks = vec!["lab_mgmt".into()];
        backend.create_vm(&vm).unwrap();
        let sent: Vec<String> = sessions.sent().into_iter().map(|s| s.line).collect();
        assert!(sent.iter().any(|l| l.starts_with("vmkfstools -c 2097152k -d thin")));
        assert!(sent
            .iter()
            .any(|l| l.starts_with("vim-cmd solo/registervm '/vmfs/volumes/datastore1/lab_r3/lab_r3.vmx'")));
    }

    #[test]
    fn test_portgroup_names_with_spaces() {
        let sessions = shell(|cmd| match cmd {
            "vim-cmd vmsvc/getallvms" => Some(GETALLVMS),
            "esxcli network vswitch standard portgroup list" => Some(PORTGROUPS),
            _ => Some(""),
        });
        let backend = EsxShellBackend::new(esx(), Arc::new(sessions.clone()), Timeouts::immediate());
        assert!(backend.portgroup_exists("my lab_mgmt").unwrap());
        assert!(backend.portgroup_exists("VM Network").unwrap());
        assert!(!backend.portgroup_exists("my").unwrap());

        let mut vm = spec();
        vm.name = "my lab_r3".into();
        vm.networks = vec!["my lab_mgmt".into(), "VM Network".into()];
        backend.create_vm(&vm).unwrap();
    }

    #[test]
    fn test_failed_command_reports_exit_status() {
        let sessions = shell(|_| None);
        let backend = EsxShellBackend::new(esx(), Arc::new(sessions), Timeouts::immediate());
        let err = backend.reconnect().unwrap_err();
        assert!(err.to_string().contains("exited with 1"));
    }

    #[test]
    fn test_destroy_missing_vm_is_ok() {
        let sessions = shell(|cmd| (cmd == "vim-cmd vmsvc/getallvms").then_some(GETALLVMS));
        let backend = EsxShellBackend::new(esx(), Arc::new(sessions), Timeouts::immediate());
        backend.destroy_vm("lab_r9").unwrap();
    }
}
