//! Topology configuration.
//!
//! A lab is described by one YAML document. The reserved sections (`ftp`,
//! `esx`, `esx_vcenter`, `settings`, `VM`, `NET`) hold lab-wide settings and
//! group defaults; every other key is a dotted section path (`VM.base.r1`)
//! inheriting from its parent. Leaf sections become concrete networks and
//! virtual machines.
//!
//! The submodules split the work:
//! - [`schema`]: declarative parameter tables and the generic validator
//! - [`entities`]: the lab-wide sections and timeouts
//! - [`document`]: the immutable section tree and its merge rules
//! - [`reader`]: turning the tree into validated networks and VMs
//! - [`loader`]: reading the file from disk

pub mod document;
pub mod entities;
pub mod loader;
pub mod reader;
pub mod schema;

use crate::ip::InterfaceError;
use std::path::PathBuf;

pub use document::SectionTree;
pub use entities::{ControlPlane, EsxHost, FtpEndpoint, ImageAccess, Settings, Timeouts};
pub use loader::{check_config_compatibility, load_topology};
pub use reader::TopologyReader;
pub use schema::{validate, Param, ParamKind, ParamType, ParamValue, Schema, ValidationError, Validated};

/// Errors raised while turning a configuration document into a lab model
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} block is absent in config file")]
    MissingSection(String),

    #[error("section '{0}' must be a mapping")]
    NotAMapping(String),

    #[error("top-level key {0:?} is not a string")]
    InvalidSectionKey(String),

    #[error("section '{section}': {source}")]
    Validation {
        section: String,
        #[source]
        source: ValidationError,
    },

    #[error("VM '{vm}': {source}")]
    Interface {
        vm: String,
        #[source]
        source: InterfaceError,
    },

    #[error("VM '{0}': interface hw0 is required")]
    MissingPrimaryInterface(String),

    #[error("invalid timeouts section: {0}")]
    Timeouts(#[source] serde_yaml::Error),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Attach the section name to a validation failure
    pub fn validation(section: impl Into<String>) -> impl FnOnce(ValidationError) -> ConfigError {
        let section = section.into();
        move |source| ConfigError::Validation { section, source }
    }
}
