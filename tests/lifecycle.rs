mod common;

use common::{lab, lab_with, LAB};
use esxlab::backend::PowerState;
use esxlab::orchestrator::{LabError, LabOptions};
use esxlab::pool::PoolError;

const R1_PIPE: &str = "/vmfs/volumes/datastore1/serial_ports/lab_r1";
const R2_PIPE: &str = "/vmfs/volumes/datastore1/serial_ports/lab_r2";

fn position(journal: &[String], entry: &str) -> usize {
    journal
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{} not in journal {:?}", entry, journal))
}

#[test]
fn test_deploy_builds_and_configures_the_lab() {
    let lab = lab();
    lab.topology.deploy(None).unwrap();

    assert_eq!(lab.backend.pools(), vec!["lab"]);
    let switches = lab.backend.vswitches();
    assert!(switches.contains(&"lab".to_string()));
    assert!(switches.contains(&"lab_core".to_string()));
    let groups: Vec<String> = lab.backend.portgroups().into_iter().map(|pg| pg.name).collect();
    for name in ["lab_lan", "lab_core", "lab_mgmt"] {
        assert!(groups.contains(&name.to_string()), "missing port group {}", name);
    }

    let r1 = lab.backend.vm("lab_r1").unwrap();
    assert_eq!(r1.power, PowerState::On);
    assert!(!r1.iso_attached);
    assert_eq!(r1.boots, 2);
    assert_eq!(r1.spec.resource_pool, "lab");
    assert_eq!(r1.spec.networks, vec!["lab_lan", "lab_core"]);
    // deploy: false
    assert!(lab.backend.vm("lab_spare").is_none());

    let journal = lab.backend.journal();
    assert!(position(&journal, "create_vm lab_r1") < position(&journal, "power_on lab_r1"));
    assert!(position(&journal, "power_off lab_r1") < position(&journal, "detach_iso lab_r1"));

    let r1_console = lab.sessions.sent_to_pipe(R1_PIPE);
    assert!(r1_console.iter().any(|l| l.ends_with("address 10.0.0.1/24")));
    assert!(r1_console.contains(&"install image".to_string()));
    let install = r1_console.iter().position(|l| l == "install image").unwrap();
    let ntp = r1_console
        .iter()
        .position(|l| l == "set system ntp server 10.0.0.1")
        .unwrap();
    assert!(install < ntp, "post-install configuration comes after the install");

    // r2 has no post-install configuration
    let r2_console = lab.sessions.sent_to_pipe(R2_PIPE);
    assert!(!r2_console.iter().any(|l| l.starts_with("set system ntp")));
}

#[test]
fn test_deploy_stops_when_esx_is_unreachable() {
    let lab = lab();
    lab.prober.set_down(common::ESX_IP);
    let err = lab.topology.deploy(None).unwrap_err();
    assert!(matches!(err, LabError::HostUnreachable(ref addr) if addr == common::ESX_IP));
    assert!(lab.backend.journal().is_empty());
}

#[test]
fn test_unreachable_vm_fails_availability() {
    let lab = lab();
    lab.prober.set_down("10.0.0.12");
    let err = lab.topology.check_lab_availability(&lab.topology.vms()).unwrap_err();
    match err {
        LabError::LabUnavailable(down) => assert_eq!(down, vec!["lab_r2"]),
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn test_destroy_tolerates_missing_objects() {
    let lab = lab();
    // Nothing was ever created
    lab.topology.destroy().unwrap();

    lab.topology.create_pool().unwrap();
    lab.topology.create_networks().unwrap();
    lab.topology.create_vms(&lab.topology.vms()).unwrap();
    lab.topology.destroy().unwrap();

    assert!(lab.backend.vm("lab_r1").is_none());
    assert!(lab.backend.vswitches().is_empty());
    assert!(lab.backend.portgroups().is_empty());
    assert!(lab.backend.pools().is_empty());
}

#[test]
fn test_create_pool_and_networks_twice() {
    let lab = lab();
    lab.topology.create_pool().unwrap();
    lab.topology.create_pool().unwrap();
    lab.topology.create_networks().unwrap();
    let report = lab.topology.create_networks().unwrap();
    assert!(report.is_clean());
}

#[test]
fn test_vm_filter_selects_by_name_fragment() {
    let options = LabOptions {
        vm_filter: vec!["R2".into()],
        ..LabOptions::default()
    };
    let lab = lab_with(LAB, options);
    let names: Vec<&str> = lab.topology.vms().iter().map(|vm| vm.name.as_str()).collect();
    assert_eq!(names, vec!["r2"]);
    assert_eq!(lab.topology.get_ctrl_addr(&lab.topology.vms()), vec!["10.0.0.12 lab_r2"]);
}

#[test]
fn test_vm_filter_without_match() {
    let reader = esxlab::config::TopologyReader::from_str(LAB, None).unwrap();
    let options = LabOptions {
        vm_filter: vec!["spare".into()],
        ..LabOptions::default()
    };
    let collaborators = esxlab::orchestrator::Collaborators {
        backend: std::sync::Arc::new(esxlab::backend::SimulatedBackend::new()),
        sessions: std::sync::Arc::new(esxlab::session::ScriptedSessions::new(|_, _| String::new())),
        prober: std::sync::Arc::new(esxlab::probe::StaticProber::all_up()),
    };
    let err = esxlab::orchestrator::Topology::new(reader, options, collaborators).err().unwrap();
    assert!(matches!(err, LabError::NoMatchingVms(ref f) if f == "spare"));
}

#[test]
fn test_create_vms_without_pool() {
    let lab = lab();
    let err = lab.topology.create_vms(&lab.topology.vms()).unwrap_err();
    assert!(matches!(err, LabError::NoResourcePool));

    let lab = lab_with(
        LAB,
        LabOptions {
            no_resource_pool: true,
            ..LabOptions::default()
        },
    );
    lab.topology.create_networks().unwrap();
    lab.topology.create_vms(&lab.topology.vms()).unwrap();
    assert_eq!(lab.backend.vm("lab_r1").unwrap().spec.resource_pool, "/");
}

#[test]
fn test_missing_network_is_critical() {
    let lab = lab();
    lab.topology.create_pool().unwrap();
    // No port groups yet
    let err = lab.topology.create_vms(&lab.topology.vms()).unwrap_err();
    assert!(err.is_critical());
    assert!(matches!(err, LabError::Pool(PoolError::Critical { .. })));
    assert!(err.to_string().starts_with("Critical error!"));
}

#[test]
fn test_five_failing_workers_are_not_critical() {
    let mut yaml = LAB.to_string();
    for i in 1..=5 {
        yaml.push_str(&format!(
            "VM.x{}:\n  ifaces:\n    hw0:\n      net: lan\n      ips: 10.0.1.{}/24\n",
            i, i
        ));
    }
    let lab = lab_with(
        &yaml,
        LabOptions {
            vm_filter: vec!["x".into()],
            ..LabOptions::default()
        },
    );
    for i in 1..=5 {
        lab.backend.break_vm(&format!("lab_x{}", i));
    }
    lab.topology.create_pool().unwrap();
    lab.topology.create_networks().unwrap();

    let report = lab.topology.create_vms(&lab.topology.vms()).unwrap();
    assert_eq!(report.failures.len(), 5);
    assert_eq!(report.completed, 0);
    assert!(report.failures.iter().all(|f| !f.critical));
}

#[test]
fn test_boot_timeout_is_a_worker_failure() {
    let lab = lab();
    lab.script.lock().unwrap().silent.insert(R2_PIPE.to_string());
    lab.topology.create_pool().unwrap();
    lab.topology.create_networks().unwrap();
    lab.topology.create_vms(&lab.topology.vms()).unwrap();

    let report = lab.topology.power_on(&lab.topology.vms(), true, false).unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].label, "lab_r2");
}

#[test]
fn test_power_on_missing_vm() {
    let lab = lab();
    let vms = lab.topology.vms();
    assert!(lab.topology.power_off(&vms, true).unwrap().is_clean());
    let report = lab.topology.power_off(&vms, false).unwrap();
    assert_eq!(report.failures.len(), 2);
}

#[test]
fn test_reboot_waits_for_the_console() {
    let lab = lab();
    lab.topology.create_pool().unwrap();
    lab.topology.create_networks().unwrap();
    let vms = lab.topology.vms();
    lab.topology.create_vms(&vms).unwrap();
    lab.topology.power_on(&vms, true, false).unwrap();

    let report = lab.topology.reboot_vms(&vms).unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    let console = lab.sessions.sent_to_pipe(R1_PIPE);
    let reboot = console.iter().position(|l| l == "reboot").unwrap();
    assert_eq!(console[reboot + 1], "yes");
}

#[test]
fn test_rejected_login_fails_the_worker() {
    let lab = lab();
    lab.script.lock().unwrap().reject_login.insert(R1_PIPE.to_string());
    lab.topology.create_pool().unwrap();
    lab.topology.create_networks().unwrap();
    let vms = lab.topology.vms();
    lab.topology.create_vms(&vms).unwrap();
    lab.topology.power_on(&vms, true, false).unwrap();

    let r1 = lab.topology.vm("r1").unwrap();
    let err = lab.topology.serial_login(r1).err().unwrap();
    assert!(matches!(err, LabError::Worker { ref vm, .. } if vm == "lab_r1"), "{}", err);
    assert!(err.to_string().contains("couldn't login"));
    // Nothing is sent once the password was refused
    assert_eq!(lab.sessions.sent_to_pipe(R1_PIPE).last().unwrap(), "vyatta");
}

#[test]
fn test_commit_failure_fails_the_worker() {
    let lab = lab();
    lab.script
        .lock()
        .unwrap()
        .replies
        .insert("set system ntp".into(), "Set failed".into());
    lab.topology.create_pool().unwrap();
    lab.topology.create_networks().unwrap();
    let vms = lab.topology.vms();
    lab.topology.create_vms(&vms).unwrap();
    lab.topology.power_on(&vms, true, false).unwrap();

    let report = lab.topology.configure().unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].message.contains("Set failed"));
}

#[test]
fn test_get_configuration_lists_both_command_sets() {
    let lab = lab();
    let configs = lab.topology.get_configuration(&lab.topology.vms());
    assert_eq!(configs.len(), 2);
    let r1 = &configs[0];
    assert_eq!(r1.name_on_host, "lab_r1");
    assert_eq!(r1.commands[0], "set system ntp server 10.0.0.1");
    assert_eq!(r1.commands[1], "configure");
    assert!(r1.to_string().starts_with("\nr1(lab_r1)\n____"));
}
