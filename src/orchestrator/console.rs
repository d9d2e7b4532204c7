//! Serial console steps.
//!
//! A VM's first serial port is a named pipe on the datastore. The console
//! is reached by opening a shell on the ESX host and attaching to that pipe
//! with `nc -U`; from then on every line sent goes to the VM.

use super::{LabError, Topology};
use crate::session::{InteractiveSession, SessionError};
use crate::vm::prompts::{
    scp_password, HOST_PASSWORD, LOGIN_CONFIG_MODE, LOGIN_PASSWORD, LOGIN_SHELL, LOGIN_USER, PROMPTS, SHELL_SUDO,
};
use crate::vm::VirtualMachine;
use log::{debug, error, info};
use std::thread;

/// Console output that marks a failed configuration or package install
pub const CONSOLE_ERRORS: [&str; 3] = ["Commit failed", "Set failed", "dpkg: error"];

/// Answers to the image installer, by question index; `None` is the VM password
const INSTALL_ANSWERS: [Option<&str>; 13] = [
    Some("install image"),
    Some("yes"),
    Some("auto"),
    Some(""),
    Some("yes"),
    Some(""),
    Some(""),
    Some(""),
    None,
    None,
    Some(""),
    Some("no"),
    Some(""),
];

/// Upper bound on installer questions before giving up
const MAX_INSTALL_ROUNDS: usize = 64;

type Console = Box<dyn InteractiveSession>;

fn on(vm: &VirtualMachine) -> impl Fn(SessionError) -> LabError + '_ {
    move |e| LabError::worker(vm, e.to_string())
}

/// First console error marker found in `output`
pub fn console_error(output: &str) -> Option<&'static str> {
    CONSOLE_ERRORS.iter().copied().find(|marker| output.contains(marker))
}

impl Topology {
    pub(crate) fn esx_session(&self) -> Result<Console, LabError> {
        Ok(self
            .sessions
            .open(&self.esx.ip, &self.esx.user, &self.esx.password, self.timeouts.login)?)
    }

    pub(crate) fn ftp_session(&self) -> Result<Console, LabError> {
        Ok(self
            .sessions
            .open(&self.ftp.ip, &self.ftp.user, &self.ftp.password, self.timeouts.login)?)
    }

    fn attach_serial(&self, vm: &VirtualMachine) -> Result<Console, LabError> {
        let mut conn = self.esx_session()?;
        conn.send_line(&format!("mkdir '{}'", vm.serial_dir)).map_err(on(vm))?;
        conn.expect(&PROMPTS.esx_shell, self.timeouts.login).map_err(on(vm))?;

        debug!("{} serial console is {}", vm.name, vm.serial_path);
        conn.send_line(&format!("nc -U '{}'", vm.serial_path)).map_err(on(vm))?;
        Ok(conn)
    }

    /// Attach to the console and log in, leaving an operational shell
    pub fn serial_login(&self, vm: &VirtualMachine) -> Result<Console, LabError> {
        let mut conn = self.attach_serial(vm)?;
        thread::sleep(self.timeouts.serial_settle);

        let login = self.timeouts.login;
        // Wake the console up; it may already be past the login prompt
        conn.send_line("").map_err(on(vm))?;
        let mut state = conn.expect(&PROMPTS.login, login).map_err(on(vm))?.index;
        if state == LOGIN_USER {
            conn.send_line(&vm.user).map_err(on(vm))?;
            state = conn.expect(&PROMPTS.login, login).map_err(on(vm))?.index;
        }
        if state == LOGIN_PASSWORD {
            conn.send_line(&vm.password).map_err(on(vm))?;
            state = conn.expect(&PROMPTS.login, login).map_err(on(vm))?.index;
        }
        // Left in configuration mode by an earlier session
        if state == LOGIN_CONFIG_MODE {
            conn.send_line("exit discard").map_err(on(vm))?;
            state = conn.expect(&PROMPTS.login, login).map_err(on(vm))?.index;
        }
        // A second login prompt means the credentials were rejected
        if state != LOGIN_SHELL {
            if let Err(e) = conn.close() {
                debug!("{}: closing console failed: {}", vm.name_on_host, e);
            }
            let err = LabError::worker(vm, "couldn't login to VM via serial connection.");
            debug!("{}", err);
            return Err(err);
        }
        Ok(conn)
    }

    /// Watch the console until the VM shows its boot marker
    pub fn wait_for_boot(&self, vm: &VirtualMachine) -> Result<(), LabError> {
        let mut conn = self.attach_serial(vm)?;
        thread::sleep(self.timeouts.boot_settle);
        let remaining = self.timeouts.boot.saturating_sub(self.timeouts.boot_settle);
        conn.expect(&PROMPTS.boot, remaining).map_err(on(vm))?;
        conn.close()?;
        info!("VM {} booted", vm.name_on_host);
        Ok(())
    }

    pub fn power_on_and_wait_for_boot(&self, vm: &VirtualMachine) -> Result<(), LabError> {
        self.backend.power_on_vm(&vm.name_on_host)?;
        self.wait_for_boot(vm)
    }

    /// Send `commands` one by one over the console.
    ///
    /// Returns the collected output. A command that gets no prompt back is
    /// logged and the next one is still sent; the step fails afterwards, as
    /// it does when the output reports a failed commit, set or dpkg run.
    pub fn send_via_serial(&self, vm: &VirtualMachine, commands: &[String]) -> Result<String, LabError> {
        let mut conn = self.serial_login(vm)?;
        info!("{}: connected", vm.name_on_host);

        let mut outputs = Vec::with_capacity(commands.len());
        let mut unanswered = Vec::new();
        for cmd in commands {
            let timeout = if cmd.starts_with("commit") {
                self.timeouts.configure.max(self.timeouts.commit)
            } else {
                self.timeouts.configure
            };
            match self.run_console_command(&mut conn, vm, cmd, timeout) {
                Ok(before) => {
                    if cmd.starts_with("ls") {
                        info!("{}:packages which will be installed:{}", vm.name_on_host, before);
                    }
                    outputs.push(format!("output: {}\n", before));
                }
                Err(e) => {
                    error!("{}:{}", vm.name_on_host, outputs.join("\n"));
                    unanswered.push(format!("'{}' ({})", cmd, e));
                }
            }
        }
        conn.close()?;

        let log = outputs.join("\n");
        if let Some(marker) = console_error(&log) {
            error!("{}:{}", vm.name_on_host, log);
            return Err(LabError::worker(vm, format!("console reported '{}'", marker)));
        }
        debug!("{}:{}", vm.name_on_host, log);
        if !unanswered.is_empty() {
            return Err(LabError::worker(
                vm,
                format!("no prompt after {}", unanswered.join(", ")),
            ));
        }
        info!("{}: commands were sent", vm.name_on_host);
        Ok(log)
    }

    /// Send one shell command, answering a sudo prompt; returns its output
    fn run_console_command(
        &self,
        conn: &mut Console,
        vm: &VirtualMachine,
        cmd: &str,
        timeout: std::time::Duration,
    ) -> Result<String, SessionError> {
        conn.send_line(cmd)?;
        let mut m = conn.expect(&PROMPTS.shell, timeout)?;
        debug!("{}: cmd {:?} matched {} after {:?}", vm.name_on_host, cmd, m.index, m.before);
        if m.index == SHELL_SUDO {
            conn.send_line(&vm.password)?;
            m = conn.expect(&PROMPTS.shell, timeout)?;
        }
        Ok(m.before)
    }

    /// Run the image installer from the live system, answering its questions
    pub fn install_image(&self, vm: &VirtualMachine) -> Result<(), LabError> {
        let mut conn = self.serial_login(vm)?;
        info!("{}: connected", vm.name_on_host);

        let install = self.timeouts.install;
        conn.send_line("install image").map_err(on(vm))?;
        let mut question = conn.expect(&PROMPTS.install, install).map_err(on(vm))?.index;
        let mut rounds = 0;
        while question != 0 {
            rounds += 1;
            if rounds > MAX_INSTALL_ROUNDS {
                if let Err(e) = conn.close() {
                    debug!("{}: closing console failed: {}", vm.name_on_host, e);
                }
                return Err(LabError::worker(vm, "image installer did not finish"));
            }
            let answer = INSTALL_ANSWERS[question].unwrap_or(vm.password.as_str());
            conn.send_line(answer).map_err(on(vm))?;
            question = conn.expect(&PROMPTS.install, install).map_err(on(vm))?.index;
        }
        conn.close()?;
        info!("{}: image installed", vm.name_on_host);
        Ok(())
    }

    /// `reboot` from the console, then wait for the boot marker
    pub fn reboot_vm(&self, vm: &VirtualMachine) -> Result<(), LabError> {
        let mut conn = self.serial_login(vm)?;
        conn.send_line("reboot").map_err(on(vm))?;
        conn.expect(&PROMPTS.reboot_confirm, self.timeouts.login).map_err(on(vm))?;
        conn.send_line("yes").map_err(on(vm))?;
        conn.close()?;

        thread::sleep(self.timeouts.reboot_grace);
        self.wait_for_boot(vm)?;
        info!("VM {} booted", vm.name);
        Ok(())
    }

    /// Fetch `.deb` packages onto the VM and install them with `dpkg -i`
    pub fn install_deb(&self, vm: &VirtualMachine, packages: &[String]) -> Result<(), LabError> {
        let plan = DebInstall::new(packages, &self.ftp.user, &self.ftp.ip);
        let shell = std::slice::from_ref(&PROMPTS.shell[0]);
        let transfer = self.timeouts.build;
        let configure = self.timeouts.configure;

        let mut conn = self.serial_login(vm)?;
        conn.send_line(&plan.rm).map_err(on(vm))?;
        conn.expect(shell, configure).map_err(on(vm))?;

        if let Some(wget) = &plan.wget {
            conn.send_line(wget).map_err(on(vm))?;
            conn.expect(shell, transfer).map_err(on(vm))?;
        }
        if let Some(scp) = &plan.scp {
            let prompts = [PROMPTS.shell[0].clone(), scp_password(&self.ftp.user, &self.ftp.ip)];
            conn.send_line(scp).map_err(on(vm))?;
            if conn.expect(&prompts, transfer).map_err(on(vm))?.index == HOST_PASSWORD {
                conn.send_line(&self.ftp.password).map_err(on(vm))?;
                conn.expect(shell, transfer).map_err(on(vm))?;
            }
        }

        conn.send_line(&plan.ls).map_err(on(vm))?;
        let listing = conn.expect(shell, configure).map_err(on(vm))?;
        info!("{}:packages which will be installed:{}", vm.name_on_host, listing.before);

        let dpkg = self
            .run_console_command(&mut conn, vm, &plan.dpkg, transfer)
            .map_err(on(vm))?;

        conn.send_line(&plan.rm).map_err(on(vm))?;
        conn.expect(shell, configure).map_err(on(vm))?;
        conn.close()?;

        if dpkg.contains("dpkg: error") {
            error!("{}:dpkg output:{}", vm.name_on_host, dpkg);
            return Err(LabError::worker(vm, "dpkg: error while installing packages"));
        }
        debug!("{}:dpkg output:{}", vm.name_on_host, dpkg);
        Ok(())
    }
}

/// Console commands installing a set of packages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebInstall {
    pub wget: Option<String>,
    pub scp: Option<String>,
    pub ls: String,
    pub dpkg: String,
    pub rm: String,
}

impl DebInstall {
    pub fn new(packages: &[String], ftp_user: &str, ftp_ip: &str) -> Self {
        let (http, remote): (Vec<&String>, Vec<&String>) = packages.iter().partition(|p| p.starts_with("http://"));
        let join = |list: &[&String]| list.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ");

        let basenames: Vec<&str> = packages
            .iter()
            .map(|p| p.rsplit('/').next().unwrap_or(p.as_str()))
            .collect();
        let debs = basenames
            .iter()
            .copied()
            .filter(|name| name.ends_with(".deb"))
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            wget: (!http.is_empty()).then(|| format!("wget {}", join(&http))),
            scp: (!remote.is_empty()).then(|| {
                format!(
                    "scp -p -oStrictHostKeyChecking=no -oUserKnownHostsFile=/dev/null {}@{}:\"{}\" . ",
                    ftp_user,
                    ftp_ip,
                    join(&remote)
                )
            }),
            ls: format!("ls -al {} --color=never", basenames.join(" ")),
            dpkg: format!("sudo dpkg -i {}", debs),
            rm: format!("rm {}", debs),
        }
    }
}
