use super::reader::TopologyReader;
use super::ConfigError;
use log::{info, warn};
use std::path::Path;

/// Load and validate a topology file
pub fn load_topology(config_path: &Path, ifaces_naming: Option<&str>) -> Result<TopologyReader, ConfigError> {
    info!("Loading configuration from: {:?}", config_path);

    let content = read(config_path)?;
    check_config_compatibility(&content);

    TopologyReader::from_str(&content, ifaces_naming)
}

fn read(config_path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(config_path).map_err(|source| ConfigError::Io {
        path: config_path.to_path_buf(),
        source,
    })
}

/// Warn about deprecated keys in a topology file; true when one was found
pub fn check_config_compatibility(content: &str) -> bool {
    // Old name of the naming scheme key; it is silently ignored otherwise
    let deprecated = content.lines().any(|l| l.trim_start().starts_with("iface_naming:"));
    if deprecated {
        warn!(
            "Configuration uses deprecated 'iface_naming' key. \
             It is ignored; use 'ifaces_naming' instead."
        );
    }
    deprecated
}
