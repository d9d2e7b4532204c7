//! Prompt patterns matched on consoles and host shells.
//!
//! All patterns are compiled with `(?s)` so `.` also matches line breaks, as
//! console output arrives in arbitrary chunks.

use regex::Regex;
use std::sync::LazyLock;

/// Index of the `login:` prompt in [`Prompts::login`]
pub const LOGIN_USER: usize = 0;
/// Index of the password prompt in [`Prompts::login`]
pub const LOGIN_PASSWORD: usize = 1;
/// Index of the operational shell prompt in [`Prompts::login`]
pub const LOGIN_SHELL: usize = 2;
/// Index of the configuration mode prompt in [`Prompts::login`]
pub const LOGIN_CONFIG_MODE: usize = 3;

/// Index of the sudo password prompt in [`Prompts::shell`]
pub const SHELL_SUDO: usize = 1;

/// Index of the password prompt in [`Prompts::host_or_password`]
pub const HOST_PASSWORD: usize = 1;

/// Compiled prompt patterns
pub struct Prompts {
    /// Serial login: `login:`, `[pP]assword:`, `$ `, `# `
    pub login: Vec<Regex>,
    /// Shell after each command: `$ ` or `# `, or a sudo password prompt
    pub shell: Vec<Regex>,
    /// Boot marker on the serial console
    pub boot: Vec<Regex>,
    /// ESX shell prompt
    pub esx_shell: Vec<Regex>,
    /// SSH login: password prompt or a shell
    pub ssh_login: Vec<Regex>,
    pub ssh_shell: Vec<Regex>,
    /// Shell prompt on the ESX or FTP host
    pub host: Vec<Regex>,
    /// Shell prompt, or scp asking for a password
    pub host_or_password: Vec<Regex>,
    /// `echo $?` printed 0
    pub exit_ok: Vec<Regex>,
    /// Image installer questions; index 0 is the shell after install
    pub install: Vec<Regex>,
    /// Confirmation asked by `reboot`
    pub reboot_confirm: Vec<Regex>,
    /// An `ls -lt` line naming an ISO; group 2 is the file stem
    pub iso_listing: Regex,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?s){}", p)).expect("Invalid prompt regex"))
        .collect()
}

impl Prompts {
    pub fn new() -> Self {
        Self {
            login: compile(&[r"login:", r"[pP]assword:", r"\$\s", r"#\s"]),
            shell: compile(&[r"[$#]\s", r"\[sudo\] password for"]),
            boot: compile(&[r"vyatta@vyatta.*\$", r"login:"]),
            esx_shell: compile(&[r".*[#\$:] $", r".*:$"]),
            ssh_login: compile(&[r".*assword: ", r".*@.*[#\$].*|~ #"]),
            ssh_shell: compile(&[r".*@.*[#\$].*|~ #"]),
            host: compile(&[r".*[#\$] "]),
            host_or_password: compile(&[r".*[#\$] ", r"[pP]assword:"]),
            exit_ok: compile(&[r"\n0(\r\n|\n).*[#\$]"]),
            install: compile(&[
                r"\$",
                r"Would you like to continue\? \(Yes/No\) \[.*\]:",
                r"Partition \(Auto/Parted/Skip\) \[.*\]:",
                r"Install the image on\? \[sda\]:",
                r"Continue\? \(Yes/No\) \[No\]:",
                r"How big of a root partition should I create\? \(.+\) \[.+\]MB:",
                r"What would you like to name this image\? \[.*\]:",
                r"Enter username for administrator account \[.*\]:",
                r"Enter password for user '.*':",
                r"Retype password for user '.*':",
                r"modify the boot partition on\? \[.*\]:",
                r"Would you like to save config information from it\?",
                r"Which one should I copy\? \[.+\]:",
            ]),
            reboot_confirm: compile(&[r"Proceed with reboot.*\]\s"]),
            iso_listing: Regex::new(r"(\S+[ ]+\S+[ ]+\S+) (\S+)\.iso").expect("Invalid iso_listing regex"),
        }
    }
}

impl Default for Prompts {
    fn default() -> Self {
        Self::new()
    }
}

/// Global patterns instance
pub static PROMPTS: LazyLock<Prompts> = LazyLock::new(Prompts::new);

/// Pattern for the password prompt of an `scp` run against `user@host`
pub fn scp_password(user: &str, host: &str) -> Regex {
    Regex::new(&format!("{}@{}'s password:", regex::escape(user), regex::escape(host)))
        .expect("escaped scp password regex is always valid")
}
