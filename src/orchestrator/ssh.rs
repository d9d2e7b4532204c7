//! Client-side ssh conveniences: public key upload and `~/.ssh/config` aliases.

use super::{LabError, Topology};
use crate::pool::PoolReport;
use crate::vm::VirtualMachine;
use chrono::Local;
use log::info;
use rand::Rng;
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// The key material (second field) of an OpenSSH public key file
pub fn read_public_key(path: &Path) -> Result<String, LabError> {
    let text = fs::read_to_string(path).map_err(|source| LabError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    text.split_whitespace()
        .nth(1)
        .map(String::from)
        .ok_or_else(|| LabError::InvalidKey(path.to_path_buf()))
}

/// Configuration commands installing `public` as key `key_id` of `user`
pub fn ssh_key_commands(user: &str, key_id: u32, public: &str) -> Vec<String> {
    vec![
        "configure".to_string(),
        format!(
            "set system login user {} authentication public-keys {} type ssh-rsa",
            user, key_id
        ),
        format!(
            "set system login user {} authentication public-keys {} key {}",
            user, key_id, public
        ),
        "commit".to_string(),
        "save".to_string(),
        "exit d".to_string(),
    ]
}

/// One `Host` block of an ssh client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAlias {
    pub host: String,
    pub hostname: String,
    pub user: String,
}

impl SshAlias {
    pub fn from_vm(vm: &VirtualMachine) -> Self {
        Self {
            host: vm.name_on_host.clone(),
            hostname: vm.address.map(|a| a.to_string()).unwrap_or_else(|| "None".into()),
            user: vm.user.clone(),
        }
    }
}

/// Replace the `Host` blocks of `aliases` in an ssh client configuration
pub fn rewrite_aliases(config: &str, aliases: &[SshAlias]) -> String {
    let mut config = config.to_string();
    for alias in aliases {
        let block = format!(r"Host {}\n(?:[ \t]+.+\n)*", regex::escape(&alias.host));
        if let Ok(re) = Regex::new(&block) {
            config = re.replace_all(&config, "").into_owned();
        }
    }
    for alias in aliases {
        config.push_str(&format!(
            "\nHost {}\n    hostname {}\n    user {}\n    Compression yes\n    StrictHostKeyChecking no",
            alias.host, alias.hostname, alias.user
        ));
    }
    config.push('\n');
    config
}

impl Topology {
    /// Authorize the local public key for the VM user on every VM
    pub fn upload_ssh_key_to_lab(&self, key_path: &Path, vms: &[&VirtualMachine]) -> Result<PoolReport, LabError> {
        let public = read_public_key(key_path)?;
        let mut rng = rand::thread_rng();
        let mut pool = self.phase("ssh key");
        for &vm in vms {
            let commands = ssh_key_commands(&vm.user, rng.gen_range(1..=9999), &public);
            pool.submit(&vm.name_on_host, move || self.send_via_serial(vm, &commands).map(|_| ()));
        }
        Ok(pool.join()?)
    }

    /// Add a `Host <name_on_host>` alias per VM to the ssh client
    /// configuration, after saving a timestamped copy next to it.
    ///
    /// Returns the path of the copy, if the configuration existed.
    pub fn create_aliases_to_lab(&self, ssh_config: &Path, vms: &[&VirtualMachine]) -> Result<Option<PathBuf>, LabError> {
        let io_err = |source| LabError::Io {
            path: ssh_config.to_path_buf(),
            source,
        };
        let (current, backup) = match fs::read_to_string(ssh_config) {
            Ok(text) => {
                let name = format!("config_{}", Local::now().format("%d-%m-%Y_%H-%M-%S"));
                let backup = ssh_config.with_file_name(name);
                fs::write(&backup, &text).map_err(|source| LabError::Io {
                    path: backup.clone(),
                    source,
                })?;
                (text, Some(backup))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (String::new(), None),
            Err(e) => return Err(io_err(e)),
        };

        let aliases: Vec<SshAlias> = vms.iter().map(|vm| SshAlias::from_vm(vm)).collect();
        fs::write(ssh_config, rewrite_aliases(&current, &aliases)).map_err(io_err)?;
        info!("{} ssh aliases written to {}", aliases.len(), ssh_config.display());
        Ok(backup)
    }
}
