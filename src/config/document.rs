//! The configuration document as an immutable section tree.

use super::ConfigError;
use log::debug;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Top-level keys every document must carry
pub const RESERVED_SECTIONS: [&str; 6] = ["ftp", "esx", "esx_vcenter", "settings", "VM", "NET"];

/// Optional reserved key holding [`Timeouts`](super::Timeouts) overrides
pub const TIMEOUTS_SECTION: &str = "timeouts";

/// Key whose list value is appended instead of overridden in `VM.*` sections
const CONFIGURATION_KEY: &str = "configuration";

/// A parsed configuration document.
///
/// Built once at load time. Resolution never mutates the tree; every call to
/// [`SectionTree::resolve`] returns a fresh merged mapping.
#[derive(Debug, Clone)]
pub struct SectionTree {
    reserved: BTreeMap<&'static str, Mapping>,
    sections: BTreeMap<String, Mapping>,
    timeouts: Option<Value>,
}

impl SectionTree {
    pub fn from_str(yaml: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let root = match value {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(ConfigError::NotAMapping("<document>".into())),
        };

        let mut reserved = BTreeMap::new();
        for key in RESERVED_SECTIONS {
            let section = root
                .get(key)
                .ok_or_else(|| ConfigError::MissingSection(key.to_string()))?;
            reserved.insert(key, as_section(key, section)?);
        }

        let mut sections = BTreeMap::new();
        let mut timeouts = None;
        for (key, value) in &root {
            let key = key
                .as_str()
                .ok_or_else(|| ConfigError::InvalidSectionKey(format!("{:?}", key)))?;
            if RESERVED_SECTIONS.contains(&key) {
                continue;
            }
            if key == TIMEOUTS_SECTION {
                timeouts = Some(value.clone());
                continue;
            }
            sections.insert(key.to_string(), as_section(key, value)?);
        }

        debug!("Loaded {} configuration sections", sections.len());
        Ok(Self { reserved, sections, timeouts })
    }

    /// One of [`RESERVED_SECTIONS`]
    pub fn reserved(&self, key: &str) -> Result<&Mapping, ConfigError> {
        self.reserved
            .get(key)
            .ok_or_else(|| ConfigError::MissingSection(key.to_string()))
    }

    pub fn timeouts(&self) -> Option<&Value> {
        self.timeouts.as_ref()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.sections.contains_key(path)
    }

    /// A section is a leaf when no other section lives below it
    pub fn is_leaf(&self, path: &str) -> bool {
        let prefix = format!("{}.", path);
        !self.sections.keys().any(|s| s.starts_with(&prefix))
    }

    /// Leaf sections under `group` (e.g. `"VM"`), in key order
    pub fn leaves(&self, group: &str) -> Vec<&str> {
        let prefix = format!("{}.", group);
        self.sections
            .keys()
            .filter(|s| s.starts_with(&prefix) && self.is_leaf(s))
            .map(String::as_str)
            .collect()
    }

    /// Merge every ancestor of `path` into one mapping, parent first.
    ///
    /// Child keys replace parent keys. Within `VM.*` sections the
    /// `configuration` list is the exception: when parent and child both
    /// carry a list and the two differ as multisets, the result is the
    /// parent's list followed by the child's.
    pub fn resolve(&self, path: &str) -> Mapping {
        let own = self.section(path);
        let Some((parent, _)) = path.rsplit_once('.') else {
            return own;
        };

        let mut merged = self.resolve(parent);
        let inherited = merged.get(CONFIGURATION_KEY).cloned();

        for (key, value) in own {
            merged.insert(key, value);
        }

        if !path.starts_with("VM.") {
            return merged;
        }
        let combined = match (inherited, merged.get(CONFIGURATION_KEY)) {
            (Some(Value::Sequence(mut parent_cmds)), Some(Value::Sequence(child_cmds)))
                if !same_multiset(&parent_cmds, child_cmds) =>
            {
                parent_cmds.extend(child_cmds.iter().cloned());
                Some(parent_cmds)
            }
            _ => None,
        };
        if let Some(cmds) = combined {
            merged.insert(Value::from(CONFIGURATION_KEY), Value::Sequence(cmds));
        }
        merged
    }

    /// A section's own mapping; reserved group names resolve to the group
    /// defaults and missing intermediate paths to an empty mapping
    fn section(&self, path: &str) -> Mapping {
        self.sections
            .get(path)
            .or_else(|| self.reserved.get(path))
            .cloned()
            .unwrap_or_default()
    }
}

fn as_section(key: &str, value: &Value) -> Result<Mapping, ConfigError> {
    match value {
        Value::Mapping(m) => Ok(m.clone()),
        Value::Null => Ok(Mapping::new()),
        _ => Err(ConfigError::NotAMapping(key.to_string())),
    }
}

fn same_multiset(a: &[Value], b: &[Value]) -> bool {
    fn sorted_keys(items: &[Value]) -> Vec<String> {
        let mut keys: Vec<String> = items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => serde_yaml::to_string(other).unwrap_or_default(),
            })
            .collect();
        keys.sort();
        keys
    }
    a.len() == b.len() && sorted_keys(a) == sorted_keys(b)
}
