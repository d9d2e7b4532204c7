//! Shared fixtures: a small lab topology and a scripted ESX host whose
//! serial consoles behave like booted routers.

#![allow(dead_code)]

use esxlab::backend::SimulatedBackend;
use esxlab::config::{Timeouts, TopologyReader};
use esxlab::orchestrator::{Collaborators, LabOptions, Topology};
use esxlab::probe::StaticProber;
use esxlab::session::scripted::ScriptContext;
use esxlab::session::ScriptedSessions;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const FTP_IP: &str = "10.0.0.5";
pub const ESX_IP: &str = "10.0.0.2";

pub const LAB: &str = r#"
ftp:
  ip: 10.0.0.5
  user: build
  password: secret
  source_folder: /srv/builds
  access: scp
  target: ''
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
NET.lan:
  isolated: false
NET.core:
  isolated: true
  vlan: 100
VM.r1:
  configuration:
    - set system ntp server 10.0.0.1
  ifaces:
    hw0:
      net: lan
      ips: 10.0.0.1/24
    hw1:
      net: core
      ips: 192.168.0.1/30
VM.r2:
  ifaces:
    hw0:
      net: lan
      ips: 10.0.0.12/24
VM.spare:
  deploy: false
  ifaces:
    hw0:
      net: lan
      ips: 10.0.0.9/24
"#;

pub const ISO_LISTING: &str = "total 610304\r\n\
    -rw-r--r-- 1 build build 312475648 Mar  3 12:01 vyatta-livecd_2014-03-03.iso\r\n\
    -rw-r--r-- 1 build build 312475100 Feb 27 09:44 vyatta-livecd_2014-02-27.iso\r\n";

const INSTALL_QUESTIONS: [&str; 12] = [
    "Would you like to continue? (Yes/No) [Yes]: ",
    "Partition (Auto/Parted/Skip) [Auto]: ",
    "Install the image on? [sda]: ",
    "Continue? (Yes/No) [No]: ",
    "How big of a root partition should I create? (1000MB - 4096MB) [4096]MB: ",
    "What would you like to name this image? [1.0]: ",
    "Enter username for administrator account [vyatta]: ",
    "Enter password for user 'vyatta': ",
    "Retype password for user 'vyatta': ",
    "Which drive should GRUB modify the boot partition on? [sda]: ",
    "Would you like to save config information from it? ",
    "Which one should I copy? [config.boot]: ",
];

const ESX_PROMPT: &str = "\r\n~ # ";
const OP_PROMPT: &str = "\r\nvyatta@r1:~$ ";
const CONF_PROMPT: &str = "\r\n[edit]\r\nvyatta@r1# ";

/// Knobs a test can turn on the scripted lab
#[derive(Debug, Default)]
pub struct Script {
    /// Console output for commands starting with the key
    pub replies: HashMap<String, String>,
    /// Serial pipes whose VM never shows a login prompt
    pub silent: HashSet<String>,
    /// Exit status printed by `echo $?` on the ESX host
    pub exit_status: u8,
    /// Serial pipes whose VM rejects the password
    pub reject_login: HashSet<String>,
}

#[derive(Debug, Default)]
struct ConsoleState {
    seen_boots: HashMap<String, u32>,
    rebooting: HashSet<String>,
}

/// A lab wired to a simulated host and scripted consoles
pub struct Lab {
    pub topology: Topology,
    pub backend: Arc<SimulatedBackend>,
    pub sessions: ScriptedSessions,
    pub prober: Arc<StaticProber>,
    pub script: Arc<Mutex<Script>>,
}

pub fn lab() -> Lab {
    lab_with(LAB, LabOptions::default())
}

pub fn lab_with(yaml: &str, options: LabOptions) -> Lab {
    let reader = TopologyReader::from_str(yaml, None).unwrap();
    let backend = Arc::new(SimulatedBackend::new());
    let script = Arc::new(Mutex::new(Script::default()));
    let sessions = scripted_host(Arc::clone(&backend), Arc::clone(&script));
    let prober = Arc::new(StaticProber::all_up());

    let options = LabOptions {
        timeouts: Some(Timeouts::immediate()),
        ..options
    };
    let collaborators = Collaborators {
        backend: backend.clone(),
        sessions: Arc::new(sessions.clone()),
        prober: prober.clone(),
    };
    let topology = Topology::new(reader, options, collaborators).unwrap();
    Lab {
        topology,
        backend,
        sessions,
        prober,
        script,
    }
}

fn vm_name(pipe: &str) -> &str {
    pipe.rsplit('/').next().unwrap_or(pipe)
}

fn scripted_host(backend: Arc<SimulatedBackend>, script: Arc<Mutex<Script>>) -> ScriptedSessions {
    let state = Mutex::new(ConsoleState::default());
    ScriptedSessions::new(move |ctx, line| {
        let script = script.lock().unwrap();
        let mut state = state.lock().unwrap();
        if ctx.host == FTP_IP {
            return ftp_reply(line);
        }
        match ctx.serial_pipe() {
            Some(pipe) => console_reply(&script, &mut state, pipe, ctx, line),
            None => esx_reply(&backend, &script, &mut state, line),
        }
    })
}

fn ftp_reply(line: &str) -> String {
    if line.starts_with("ls -lt") {
        format!("{}\r\n{}build@ftp:~$ ", line, ISO_LISTING)
    } else {
        "\r\nbuild@ftp:~$ ".to_string()
    }
}

fn esx_reply(
    backend: &SimulatedBackend,
    script: &Script,
    state: &mut ConsoleState,
    line: &str,
) -> String {
    if let Some(path) = line.strip_prefix("nc -U ") {
        let pipe = path.trim_matches('\'');
        if script.silent.contains(pipe) {
            return String::new();
        }
        let boots = backend.vm(vm_name(pipe)).map(|vm| vm.boots).unwrap_or(0);
        let seen = state.seen_boots.entry(pipe.to_string()).or_insert(0);
        if boots > *seen || state.rebooting.remove(pipe) {
            *seen = boots;
            return "\r\nWelcome to Vyatta\r\nvyatta login: ".to_string();
        }
        return String::new();
    }
    if line == "echo $?" {
        return format!("echo $?\r\n{}{}", script.exit_status, ESX_PROMPT);
    }
    if line.starts_with("ls -lt") {
        return format!("\r\n{}{}", ISO_LISTING, ESX_PROMPT);
    }
    if line.starts_with("scp ") {
        return format!("\r\nbuild@{}'s password: ", FTP_IP);
    }
    ESX_PROMPT.to_string()
}

fn console_reply(script: &Script, state: &mut ConsoleState, pipe: &str, ctx: &ScriptContext, line: &str) -> String {
    if script.silent.contains(pipe) {
        return String::new();
    }
    let history = &ctx.history;
    let last = history.last().map(String::as_str);

    if line == "install image" {
        return INSTALL_QUESTIONS[0].to_string();
    }
    if let Some(pos) = history.iter().rposition(|l| l == "install image") {
        let answered = history.len() - pos;
        return match INSTALL_QUESTIONS.get(answered) {
            Some(question) => format!("\r\n{}", question),
            None => OP_PROMPT.to_string(),
        };
    }

    if line.is_empty() {
        return "\r\nvyatta login: ".to_string();
    }
    if last == Some("") {
        return "\r\nPassword: ".to_string();
    }
    if history.len() >= 2 && history[history.len() - 2].is_empty() {
        if script.reject_login.contains(pipe) {
            return "\r\nLogin incorrect\r\nvyatta login: ".to_string();
        }
        return OP_PROMPT.to_string();
    }

    if line == "reboot" {
        state.rebooting.insert(pipe.to_string());
        return "\r\nProceed with reboot? (Yes/No) [No] ".to_string();
    }
    if line.starts_with("sudo ") {
        return "\r\n[sudo] password for vyatta: ".to_string();
    }
    if line.starts_with("scp ") {
        return format!("\r\nbuild@{}'s password: ", FTP_IP);
    }
    if let Some(prev) = last.filter(|l| l.starts_with("sudo ") || l.starts_with("scp ")) {
        let output = reply_for(script, prev).unwrap_or_default();
        return format!("\r\n{}{}", output, OP_PROMPT);
    }
    if let Some(output) = reply_for(script, line) {
        return format!("\r\n{}{}", output, CONF_PROMPT);
    }
    if line.starts_with("exit") {
        return OP_PROMPT.to_string();
    }
    CONF_PROMPT.to_string()
}

fn reply_for(script: &Script, line: &str) -> Option<String> {
    script
        .replies
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix.as_str()))
        .map(|(_, output)| output.clone())
}
