use chrono::Local;
use clap::{Parser, ValueEnum};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use env_logger::{Env, Target};
use esxlab::backend::EsxShellBackend;
use esxlab::config::load_topology;
use esxlab::orchestrator::{Collaborators, LabError, LabOptions, Topology};
use esxlab::probe::SystemPing;
use esxlab::session::process::SshSessions;
use log::{error, info};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Deploys and tears down multi-VM router labs on an ESXi host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Actions to run, chained with '+' or ',' (e.g. deploy+aliases)
    action: String,

    /// Path to the lab topology YAML file
    config: PathBuf,

    /// Only touch VMs whose name contains one of these ('all' for every VM)
    #[arg(short = 'f', long = "vmfilter", num_args = 1..)]
    vmfilter: Vec<String>,

    /// ISO image in the FTP source folder (default: the newest one)
    #[arg(short, long)]
    iso: Option<String>,

    /// Do not write a log file under log/
    #[arg(long)]
    no_log: bool,

    /// Run per-VM tasks one at a time
    #[arg(long)]
    single: bool,

    /// Do not create or use a resource pool
    #[arg(long)]
    no_rp: bool,

    #[arg(short, long, value_enum, default_value = "INFO")]
    log_level: LogLevel,

    /// Override the interface naming scheme of every VM
    #[arg(long, value_parser = ["old", "new"])]
    ifaces_naming: Option<String>,

    /// .deb packages for the update action (FTP paths or http:// URLs)
    #[arg(short, long, num_args = 1..)]
    packages: Vec<String>,

    /// Public key uploaded by the ssh action [default: ~/.ssh/id_rsa.pub]
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Client configuration rewritten by the aliases action [default: ~/.ssh/config]
    #[arg(long)]
    ssh_config: Option<PathBuf>,

    /// Print getconfiguration output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    Info,
    Debug,
    Warning,
    Error,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Deploy,
    Destroy,
    PowerOn,
    PowerOff,
    Reset,
    Reboot,
    Update,
    Ping,
    Configure,
    GetConfiguration,
    GetCtrlAddr,
    Check,
    Ssh,
    Aliases,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "deploy" | "create" => Action::Deploy,
            "destroy" => Action::Destroy,
            "start" | "poweron" => Action::PowerOn,
            "stop" | "poweroff" => Action::PowerOff,
            "restart" | "reset" => Action::Reset,
            "reboot" => Action::Reboot,
            "update" => Action::Update,
            "ping" => Action::Ping,
            "configure" => Action::Configure,
            "getconfiguration" => Action::GetConfiguration,
            "getctrladdr" => Action::GetCtrlAddr,
            "check" => Action::Check,
            "ssh" => Action::Ssh,
            "aliases" => Action::Aliases,
            other => return Err(format!("unknown action '{}'", other)),
        })
    }
}

fn parse_actions(chain: &str) -> std::result::Result<Vec<Action>, String> {
    chain
        .split(['+', ','])
        .filter(|a| !a.trim().is_empty())
        .map(Action::from_str)
        .collect()
}

/// Copies every log record to stderr and the run's log file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(args.log_level.filter()));
    if !args.no_log {
        fs::create_dir_all("log").wrap_err("Failed to create log directory")?;
        let name = format!(
            "{}_{}.log",
            Local::now().format("%Y-%m-%d_%H-%M-%S"),
            args.action.replace(['+', ','], "_")
        );
        let path = Path::new("log").join(name);
        let file = File::create(&path).wrap_err_with(|| format!("Failed to create log file '{}'", path.display()))?;
        builder.target(Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
    Ok(())
}

fn home_path(relative: &str) -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(relative)
}

fn vm_filter(args: &Args) -> Vec<String> {
    if args.vmfilter.iter().any(|f| f.eq_ignore_ascii_case("all")) {
        Vec::new()
    } else {
        args.vmfilter.clone()
    }
}

/// Any `-f`, even `-f all`, limits `destroy` to the VMs and keeps the
/// pool and networks
fn vm_only_destroy(args: &Args) -> bool {
    !args.vmfilter.is_empty()
}

/// Read the topology file and select the VMs to work on
fn build_topology(args: &Args) -> Result<Topology> {
    let reader = load_topology(&args.config, args.ifaces_naming.as_deref())
        .wrap_err_with(|| format!("Failed to load '{}'", args.config.display()))?;

    let sessions = Arc::new(SshSessions::new());
    let backend = Arc::new(EsxShellBackend::new(reader.esx.clone(), sessions.clone(), reader.timeouts));
    let options = LabOptions {
        vm_filter: vm_filter(args),
        no_resource_pool: args.no_rp,
        single: args.single,
        timeouts: None,
    };
    let collaborators = Collaborators {
        backend,
        sessions,
        prober: Arc::new(SystemPing),
    };
    Topology::new(reader, options, collaborators)
        .wrap_err_with(|| format!("No lab to work on in '{}'", args.config.display()))
}

fn run_action(topology: &Topology, action: Action, args: &Args, filtered: bool) -> std::result::Result<(), LabError> {
    let vms = topology.vms();
    match action {
        Action::Deploy => topology.deploy(args.iso.as_deref())?,
        Action::Destroy if filtered => {
            topology.destroy_vms(&vms)?;
        }
        Action::Destroy => topology.destroy()?,
        Action::PowerOn => {
            topology.power_on(&vms, true, false)?;
        }
        Action::PowerOff => {
            topology.power_off(&vms, false)?;
        }
        Action::Reset => {
            topology.reset_vms(&vms)?;
        }
        Action::Reboot => {
            topology.reboot_vms(&vms)?;
        }
        Action::Update => {
            topology.update_with_deb(&args.packages, &vms)?;
        }
        Action::Ping => topology.check_lab_availability(&vms)?,
        Action::Configure => {
            topology.configure()?;
        }
        Action::GetConfiguration => {
            let configs = topology.get_configuration(&vms);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&configs)?);
            } else {
                for config in configs {
                    println!("{}", config);
                }
            }
        }
        Action::GetCtrlAddr => {
            for line in topology.get_ctrl_addr(&vms) {
                println!("{}", line);
            }
        }
        Action::Check => info!("Configuration {} is valid", args.config.display()),
        Action::Ssh => {
            let key = args.ssh_key.clone().unwrap_or_else(|| home_path(".ssh/id_rsa.pub"));
            topology.upload_ssh_key_to_lab(&key, &vms)?;
        }
        Action::Aliases => {
            let config = args.ssh_config.clone().unwrap_or_else(|| home_path(".ssh/config"));
            if let Some(backup) = topology.create_aliases_to_lab(&config, &vms)? {
                info!("Previous ssh config saved to {}", backup.display());
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_logging(&args)?;
    let started = Instant::now();

    let actions = match parse_actions(&args.action) {
        Ok(actions) => actions,
        Err(e) => bail!(e),
    };
    if actions.contains(&Action::Update) && args.packages.is_empty() {
        bail!("The update action needs --packages");
    }

    let topology = match build_topology(&args) {
        Ok(topology) => topology,
        Err(e) if actions.contains(&Action::Check) => {
            error!("Configuration {} is invalid: {:#}", args.config.display(), e);
            process::exit(1);
        }
        Err(e) => return Err(e),
    };
    let filtered = vm_only_destroy(&args);

    for action in actions {
        info!("Running action {:?}", action);
        if let Err(e) = run_action(&topology, action, &args, filtered) {
            error!("{}", e);
            if e.is_critical() {
                error!("Aborting after critical error");
            }
            info!("Elapsed time: {:?}", started.elapsed());
            process::exit(1);
        }
    }

    info!("Elapsed time: {:?}", started.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use esxlab::backend::SimulatedBackend;
    use esxlab::config::{Timeouts, TopologyReader};
    use esxlab::probe::StaticProber;
    use esxlab::session::ScriptedSessions;
    use tempfile::NamedTempFile;

    const LAB: &str = r#"
ftp: {ip: 10.0.0.5, user: u, password: p, source_folder: /srv, access: scp, target: ''}
esx: {ip: 10.0.0.2, user: root, name: esx1, password: p, datastore: ds1}
esx_vcenter: {ip: 10.0.0.3, user: admin, password: p}
settings: {networks: [], pool_name: lab}
NET: {}
NET.lan: {isolated: false}
VM:
  type: vyatta5400
  user: vyatta
  password: vyatta
  default_gw: 10.0.0.254
  memory: 1024
  cpu: 1
  disk_space: 2048
VM.r1:
  ifaces:
    hw0: {net: lan, ips: 10.0.0.1/24}
"#;

    fn simulated_lab(args: &Args) -> (Topology, Arc<SimulatedBackend>) {
        let reader = TopologyReader::from_str(LAB, None).unwrap();
        let backend = Arc::new(SimulatedBackend::new());
        let options = LabOptions {
            vm_filter: vm_filter(args),
            timeouts: Some(Timeouts::immediate()),
            ..LabOptions::default()
        };
        let collaborators = Collaborators {
            backend: backend.clone(),
            sessions: Arc::new(ScriptedSessions::new(|_, _| String::new())),
            prober: Arc::new(StaticProber::all_up()),
        };
        (Topology::new(reader, options, collaborators).unwrap(), backend)
    }

    #[test]
    fn test_cli_parsing() {
        let args = Args::parse_from([
            "esxlab",
            "deploy+aliases",
            "lab.yaml",
            "-f",
            "r1",
            "r2",
            "--no-rp",
            "-l",
            "DEBUG",
        ]);

        assert_eq!(args.config, PathBuf::from("lab.yaml"));
        assert_eq!(args.vmfilter, vec!["r1", "r2"]);
        assert!(args.no_rp);
        assert!(!args.single);
        assert_eq!(args.log_level, LogLevel::Debug);
        assert_eq!(args.ssh_key, None);
    }

    #[test]
    fn test_action_chain() {
        assert_eq!(
            parse_actions("create+configure,getctrladdr").unwrap(),
            vec![Action::Deploy, Action::Configure, Action::GetCtrlAddr]
        );
        assert!(parse_actions("deploy+explode").is_err());
    }

    #[test]
    fn test_all_filter_selects_everything() {
        let args = Args::parse_from(["esxlab", "destroy", "lab.yaml", "-f", "ALL"]);
        assert!(vm_filter(&args).is_empty());
    }

    #[test]
    fn test_destroy_with_all_filter_keeps_pool_and_networks() {
        let args = Args::parse_from(["esxlab", "destroy", "lab.yaml", "-f", "all"]);
        assert!(vm_only_destroy(&args));
        let (topology, backend) = simulated_lab(&args);
        topology.create_pool().unwrap();
        topology.create_networks().unwrap();
        topology.create_vms(&topology.vms()).unwrap();

        run_action(&topology, Action::Destroy, &args, vm_only_destroy(&args)).unwrap();
        assert!(backend.vm("lab_r1").is_none());
        assert_eq!(backend.pools(), vec!["lab"]);
        assert!(!backend.vswitches().is_empty());

        let plain = Args::parse_from(["esxlab", "destroy", "lab.yaml"]);
        assert!(!vm_only_destroy(&plain));
        run_action(&topology, Action::Destroy, &plain, vm_only_destroy(&plain)).unwrap();
        assert!(backend.pools().is_empty());
    }

    #[test]
    fn test_json_configuration_report() {
        let args = Args::parse_from(["esxlab", "getconfiguration", "lab.yaml", "--json"]);
        let (topology, _) = simulated_lab(&args);
        run_action(&topology, Action::GetConfiguration, &args, false).unwrap();

        let err: LabError = serde_json::from_str::<Vec<String>>("{").unwrap_err().into();
        assert!(err.to_string().starts_with("Couldn't render the configuration report"));
        assert!(!err.is_critical());
    }

    #[test]
    fn test_lab_without_deployable_vms_fails_to_build() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", LAB.replace("VM.r1:\n", "VM.r1:\n  deploy: false\n")).unwrap();
        let args = Args::parse_from(["esxlab", "check", file.path().to_str().unwrap()]);

        let err = build_topology(&args).err().unwrap();
        assert!(err
            .chain()
            .any(|cause| cause.to_string().starts_with("Could not find any host")));
    }
}
