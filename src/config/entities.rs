//! Lab-wide configuration sections.
//!
//! The reserved `ftp`, `esx`, `esx_vcenter` and `settings` sections are
//! validated on their own before any network or VM is built.

use super::schema::{validate, validate_datastore_path, Param, ParamType, Schema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::fmt;
use std::time::Duration;

/// How the installation image reaches the ESX datastore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageAccess {
    /// Copied with `scp` from the FTP host into the datastore
    Scp,
    /// Symlinked from an NFS datastore already mounted on the host
    Nfs,
}

impl fmt::Display for ImageAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageAccess::Scp => f.write_str("scp"),
            ImageAccess::Nfs => f.write_str("nfs"),
        }
    }
}

/// Build server the installation images are fetched from
#[derive(Debug, Clone, Serialize)]
pub struct FtpEndpoint {
    pub ip: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Folder holding the images; always ends with `/`
    pub source_folder: String,
    pub access: ImageAccess,
    /// Datastore path the image is published to, e.g. `[datastore1] lab/vyatta.iso`
    pub target: String,
}

impl FtpEndpoint {
    pub const SCHEMA: Schema = Schema {
        entity: "ftp",
        params: &[
            Param::required("ip", ParamType::Str),
            Param::required("user", ParamType::Str),
            Param::required("password", ParamType::Str),
            Param::required("source_folder", ParamType::Str),
            Param::required("access", ParamType::Str),
            Param::required("target", ParamType::Str),
        ],
    };

    pub fn from_config(raw: &Mapping) -> Result<Self, ValidationError> {
        let v = validate(&Self::SCHEMA, raw)?;

        let access = match v.string("access")?.to_lowercase().as_str() {
            "scp" => ImageAccess::Scp,
            "nfs" => ImageAccess::Nfs,
            other => {
                return Err(ValidationError::InvalidValue {
                    name: "access".into(),
                    value: other.to_string(),
                    reason: "expected 'scp' or 'nfs'".into(),
                })
            }
        };

        let target = v.string("target")?;
        if !target.is_empty() {
            validate_datastore_path(&target)?;
        }

        let mut source_folder = v.string("source_folder")?;
        if !source_folder.ends_with('/') {
            source_folder.push('/');
        }
        if access == ImageAccess::Nfs {
            validate_datastore_path(&source_folder)?;
        }

        Ok(Self {
            ip: v.string("ip")?,
            user: v.string("user")?,
            password: v.string("password")?,
            source_folder,
            access,
            target,
        })
    }
}

/// The ESX host the lab runs on
#[derive(Debug, Clone, Serialize)]
pub struct EsxHost {
    pub ip: String,
    pub user: String,
    /// Host name as known by vCenter
    pub name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub datastore: String,
}

impl EsxHost {
    pub const SCHEMA: Schema = Schema {
        entity: "esx",
        params: &[
            Param::required("ip", ParamType::Str),
            Param::required("user", ParamType::Str),
            Param::required("name", ParamType::Str),
            Param::required("password", ParamType::Str),
            Param::required("datastore", ParamType::Str),
        ],
    };

    pub fn from_config(raw: &Mapping) -> Result<Self, ValidationError> {
        let v = validate(&Self::SCHEMA, raw)?;
        Ok(Self {
            ip: v.string("ip")?,
            user: v.string("user")?,
            name: v.string("name")?,
            password: v.string("password")?,
            datastore: v.string("datastore")?,
        })
    }
}

/// vCenter (or the host's own management endpoint) used for VM control
#[derive(Debug, Clone, Serialize)]
pub struct ControlPlane {
    pub ip: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub datacenter: Option<String>,
}

impl ControlPlane {
    pub const SCHEMA: Schema = Schema {
        entity: "esx_vcenter",
        params: &[
            Param::required("ip", ParamType::Str),
            Param::required("user", ParamType::Str),
            Param::required("password", ParamType::Str),
            Param::optional("datacenter", ParamType::Str),
        ],
    };

    pub fn from_config(raw: &Mapping) -> Result<Self, ValidationError> {
        let v = validate(&Self::SCHEMA, raw)?;
        Ok(Self {
            ip: v.string("ip")?,
            user: v.string("user")?,
            password: v.string("password")?,
            datacenter: v.opt_str("datacenter")?,
        })
    }
}

/// Lab-wide settings
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Networks every lab gets, even without a `NET.<name>` section
    pub networks: Vec<String>,
    /// Resource pool name, also the prefix of every object on the host
    pub pool_name: String,
}

impl Settings {
    pub const SCHEMA: Schema = Schema {
        entity: "settings",
        params: &[
            Param::list("networks", &[ParamType::Str]),
            Param::required("pool_name", ParamType::Str),
        ],
    };

    pub fn from_config(raw: &Mapping) -> Result<Self, ValidationError> {
        let v = validate(&Self::SCHEMA, raw)?;
        Ok(Self {
            networks: v.str_list("networks")?,
            pool_name: v.string("pool_name")?,
        })
    }
}

/// Timeouts and settle delays used while driving consoles and the host.
///
/// Read from the optional `timeouts` section, e.g.
///
/// ```yaml
/// timeouts:
///   boot: 10m
///   install: 5m
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Waiting for a login or shell prompt
    #[serde(with = "humantime_serde")]
    pub login: Duration,
    /// Waiting for the prompt after each configuration command
    #[serde(with = "humantime_serde")]
    pub configure: Duration,
    /// Waiting for a commit to finish
    #[serde(with = "humantime_serde")]
    pub commit: Duration,
    /// Waiting for each step of the image installer
    #[serde(with = "humantime_serde")]
    pub install: Duration,
    /// Waiting for the boot marker on the serial console
    #[serde(with = "humantime_serde")]
    pub boot: Duration,
    /// Copying or linking the installation image
    #[serde(with = "humantime_serde")]
    pub build: Duration,
    /// Pause after attaching to a serial pipe
    #[serde(with = "humantime_serde")]
    pub serial_settle: Duration,
    /// Pause before looking for the boot marker
    #[serde(with = "humantime_serde")]
    pub boot_settle: Duration,
    /// Pause between confirming a reboot and reattaching to the console
    #[serde(with = "humantime_serde")]
    pub reboot_grace: Duration,
    /// How long the backend polls for a power state change
    #[serde(with = "humantime_serde")]
    pub power_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            login: Duration::from_secs(15),
            configure: Duration::from_secs(90),
            commit: Duration::from_secs(12),
            install: Duration::from_secs(180),
            boot: Duration::from_secs(300),
            build: Duration::from_secs(1500),
            serial_settle: Duration::from_secs(2),
            boot_settle: Duration::from_secs(5),
            reboot_grace: Duration::from_secs(30),
            power_poll: Duration::from_secs(10),
        }
    }
}

impl Timeouts {
    /// No settle delays and short waits; for scripted sessions in tests
    pub fn immediate() -> Self {
        Self {
            login: Duration::from_millis(50),
            configure: Duration::from_millis(50),
            commit: Duration::from_millis(50),
            install: Duration::from_millis(50),
            boot: Duration::from_millis(50),
            build: Duration::from_millis(50),
            serial_settle: Duration::ZERO,
            boot_settle: Duration::ZERO,
            reboot_grace: Duration::ZERO,
            power_poll: Duration::from_millis(50),
        }
    }
}
