//! Boot-time configuration commands for text-configured routers.

use super::VirtualMachine;
use crate::ip::{V4Binding, V6Binding};

/// Build the command list pushed over the serial console before install.
///
/// Interfaces that own their address get plain `address` lines; every VLAN
/// gets a `vif` declaration followed by its own address lines. IPv4 always
/// comes before IPv6.
pub fn boot_commands(vm: &VirtualMachine) -> Vec<String> {
    let kind = vm.iface_kind.to_string();
    let mut commands = vec![
        "configure".to_string(),
        "set system console device ttyS0 speed 115200".to_string(),
        "commit".to_string(),
    ];

    for iface in &vm.hardware {
        if iface.owns_ip {
            let prefix = format!("set interface {} {}", kind, iface.name);
            push_addresses(&mut commands, &prefix, iface.v4.as_ref(), iface.v6.as_ref());
        }
        for vlan in &iface.vlans {
            let Some(num) = vlan.vlan_id else { continue };
            let vif = format!("set interface {} {} vif {}", kind, iface.name, num);
            commands.push(format!("{} vlan {}", vif, num));
            push_addresses(&mut commands, &vif, vlan.v4.as_ref(), vlan.v6.as_ref());
        }
    }

    for lo in &vm.loopbacks {
        let prefix = format!("set interface loopback {}", lo.name);
        push_addresses(&mut commands, &prefix, lo.v4.as_ref(), lo.v6.as_ref());
    }

    let user = &vm.user;
    commands.extend([
        format!("set system host-name {}", vm.hostname),
        "set system login group secrets".to_string(),
        format!("set system login user {} group secrets", user),
        format!("set system login user {} level superuser", user),
        format!("set system login user {} authentication plaintext-password {}", user, vm.password),
        format!("set protocols static route 0.0.0.0/0 next {}", vm.default_gw),
        "set service telnet".to_string(),
        "set service ssh".to_string(),
        "set service https".to_string(),
        "commit".to_string(),
        "save".to_string(),
        "exit discard".to_string(),
    ]);
    commands
}

fn push_addresses(commands: &mut Vec<String>, prefix: &str, v4: Option<&V4Binding>, v6: Option<&V6Binding>) {
    if let Some(v4) = v4 {
        commands.push(format!("{} address {}", prefix, v4.cidr()));
    }
    if let Some(v6) = v6 {
        commands.push(format!("{} address {}", prefix, v6.cidr()));
    }
}
