//! Declarative parameter schemas.
//!
//! Every configuration entity (network, VM, FTP endpoint, ESX host, vCenter,
//! settings) declares an ordered table of [`Param`]s. [`validate`] checks a raw
//! YAML mapping against such a table, coerces scalar values into the declared
//! types and returns a [`Validated`] record the entity reads its fields from.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Errors raised while validating configuration entities
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{entity}: parameter '{name}' absent")]
    MissingParameter { entity: &'static str, name: String },

    #[error("{entity}: parameter '{name}' has type {found}, while {expected} expected")]
    TypeMismatch {
        entity: &'static str,
        name: String,
        expected: ParamType,
        found: &'static str,
    },

    #[error("{entity}: only lists of len 1 are supported as type constraints, '{name}' declares {item_types}")]
    SchemaMisconfigured {
        entity: &'static str,
        name: &'static str,
        item_types: usize,
    },

    #[error("{entity}: parameter '{name}' is not declared in the schema")]
    UndeclaredParameter { entity: &'static str, name: String },

    #[error("Path '{0}' doesn't match '[datastore] path' expression")]
    InvalidPath(String),

    #[error("VM type '{0}' is not supported")]
    UnsupportedVariant(String),

    #[error("platform {platform} has no {kind} interfaces")]
    UnsupportedInterfaceKind { platform: String, kind: String },

    #[error("parameter '{name}' has invalid value '{value}': {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
}

/// Scalar (or mapping) type a parameter is coerced into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Str,
    Int,
    Bool,
    Mapping,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Str => "string",
            ParamType::Int => "integer",
            ParamType::Bool => "boolean",
            ParamType::Mapping => "mapping",
        };
        f.write_str(name)
    }
}

/// How a parameter participates in validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Required(ParamType),
    /// Absent (or `null`) values validate to [`ParamValue::Absent`]
    Optional(ParamType),
    /// A list whose items all have the single declared type
    RequiredList(&'static [ParamType]),
    OptionalList(&'static [ParamType]),
}

#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl Param {
    pub const fn required(name: &'static str, tp: ParamType) -> Self {
        Self { name, kind: ParamKind::Required(tp) }
    }

    pub const fn optional(name: &'static str, tp: ParamType) -> Self {
        Self { name, kind: ParamKind::Optional(tp) }
    }

    pub const fn list(name: &'static str, item: &'static [ParamType]) -> Self {
        Self { name, kind: ParamKind::RequiredList(item) }
    }

    pub const fn optional_list(name: &'static str, item: &'static [ParamType]) -> Self {
        Self { name, kind: ParamKind::OptionalList(item) }
    }
}

/// A named, ordered parameter table
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub entity: &'static str,
    pub params: &'static [Param],
}

/// A validated, coerced parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Absent,
    Str(String),
    Int(i64),
    Bool(bool),
    Mapping(Mapping),
    List(Vec<ParamValue>),
}

/// Result of [`validate`]: every declared parameter plus the undeclared keys
#[derive(Debug, Clone)]
pub struct Validated {
    entity: &'static str,
    values: BTreeMap<&'static str, ParamValue>,
    /// Keys present in the input but not declared by the schema
    pub extra: Mapping,
}

/// Validate `raw` against `schema`.
///
/// Optional parameters missing from the input become [`ParamValue::Absent`];
/// required ones fail with [`ValidationError::MissingParameter`]. Present
/// values must match (or be coercible into) the declared type.
pub fn validate(schema: &Schema, raw: &Mapping) -> Result<Validated, ValidationError> {
    let mut values = BTreeMap::new();

    for param in schema.params {
        let value = match raw.get(param.name) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        };

        let validated = match (param.kind, value) {
            (ParamKind::Optional(_), None) | (ParamKind::OptionalList(_), None) => ParamValue::Absent,
            (ParamKind::Required(_), None) | (ParamKind::RequiredList(_), None) => {
                // Lists are checked for misconfiguration before anything else
                if let ParamKind::RequiredList(items) = param.kind {
                    item_type(schema, param.name, items)?;
                }
                return Err(ValidationError::MissingParameter {
                    entity: schema.entity,
                    name: param.name.to_string(),
                });
            }
            (ParamKind::Required(tp), Some(v)) | (ParamKind::Optional(tp), Some(v)) => {
                coerce(schema, param.name, tp, v)?
            }
            (ParamKind::RequiredList(items), Some(v)) | (ParamKind::OptionalList(items), Some(v)) => {
                let tp = item_type(schema, param.name, items)?;
                let seq = v.as_sequence().ok_or_else(|| ValidationError::TypeMismatch {
                    entity: schema.entity,
                    name: param.name.to_string(),
                    expected: tp,
                    found: value_kind(v),
                })?;
                let items = seq
                    .iter()
                    .map(|item| coerce(schema, param.name, tp, item))
                    .collect::<Result<Vec<_>, _>>()?;
                ParamValue::List(items)
            }
        };
        values.insert(param.name, validated);
    }

    let extra = raw
        .iter()
        .filter(|(k, _)| {
            k.as_str()
                .map_or(true, |k| !schema.params.iter().any(|p| p.name == k))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Validated { entity: schema.entity, values, extra })
}

fn item_type(schema: &Schema, name: &'static str, items: &[ParamType]) -> Result<ParamType, ValidationError> {
    match items {
        [tp] => Ok(*tp),
        _ => Err(ValidationError::SchemaMisconfigured {
            entity: schema.entity,
            name,
            item_types: items.len(),
        }),
    }
}

fn coerce(schema: &Schema, name: &str, tp: ParamType, value: &Value) -> Result<ParamValue, ValidationError> {
    let coerced = match (tp, value) {
        (ParamType::Str, Value::String(s)) => Some(ParamValue::Str(s.clone())),
        (ParamType::Str, Value::Number(n)) => Some(ParamValue::Str(n.to_string())),
        (ParamType::Str, Value::Bool(b)) => Some(ParamValue::Str(b.to_string())),
        (ParamType::Int, Value::Number(n)) => n.as_i64().map(ParamValue::Int),
        (ParamType::Int, Value::String(s)) => s.trim().parse().ok().map(ParamValue::Int),
        (ParamType::Bool, Value::Bool(b)) => Some(ParamValue::Bool(*b)),
        (ParamType::Bool, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" => Some(ParamValue::Bool(true)),
            "false" | "no" | "off" => Some(ParamValue::Bool(false)),
            _ => None,
        },
        (ParamType::Mapping, Value::Mapping(m)) => Some(ParamValue::Mapping(m.clone())),
        _ => None,
    };

    coerced.ok_or_else(|| ValidationError::TypeMismatch {
        entity: schema.entity,
        name: name.to_string(),
        expected: tp,
        found: value_kind(value),
    })
}

/// Human readable YAML kind, used in type mismatch messages
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

impl Validated {
    fn get(&self, name: &str) -> Result<&ParamValue, ValidationError> {
        self.values.get(name).ok_or_else(|| ValidationError::UndeclaredParameter {
            entity: self.entity,
            name: name.to_string(),
        })
    }

    fn mismatch(&self, name: &str, expected: ParamType, found: &ParamValue) -> ValidationError {
        let found = match found {
            ParamValue::Absent => "null",
            ParamValue::Str(_) => "string",
            ParamValue::Int(_) => "number",
            ParamValue::Bool(_) => "boolean",
            ParamValue::Mapping(_) => "mapping",
            ParamValue::List(_) => "list",
        };
        ValidationError::TypeMismatch {
            entity: self.entity,
            name: name.to_string(),
            expected,
            found,
        }
    }

    pub fn is_absent(&self, name: &str) -> bool {
        matches!(self.values.get(name), None | Some(ParamValue::Absent))
    }

    pub fn opt_str(&self, name: &str) -> Result<Option<String>, ValidationError> {
        match self.get(name)? {
            ParamValue::Absent => Ok(None),
            ParamValue::Str(s) => Ok(Some(s.clone())),
            other => Err(self.mismatch(name, ParamType::Str, other)),
        }
    }

    pub fn string(&self, name: &str) -> Result<String, ValidationError> {
        self.opt_str(name)?.ok_or_else(|| ValidationError::MissingParameter {
            entity: self.entity,
            name: name.to_string(),
        })
    }

    pub fn opt_int(&self, name: &str) -> Result<Option<i64>, ValidationError> {
        match self.get(name)? {
            ParamValue::Absent => Ok(None),
            ParamValue::Int(i) => Ok(Some(*i)),
            other => Err(self.mismatch(name, ParamType::Int, other)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, ValidationError> {
        self.opt_int(name)?.ok_or_else(|| ValidationError::MissingParameter {
            entity: self.entity,
            name: name.to_string(),
        })
    }

    pub fn opt_bool(&self, name: &str) -> Result<Option<bool>, ValidationError> {
        match self.get(name)? {
            ParamValue::Absent => Ok(None),
            ParamValue::Bool(b) => Ok(Some(*b)),
            other => Err(self.mismatch(name, ParamType::Bool, other)),
        }
    }

    pub fn opt_mapping(&self, name: &str) -> Result<Option<&Mapping>, ValidationError> {
        match self.get(name)? {
            ParamValue::Absent => Ok(None),
            ParamValue::Mapping(m) => Ok(Some(m)),
            other => Err(self.mismatch(name, ParamType::Mapping, other)),
        }
    }

    /// A list of strings; an absent optional list is empty
    pub fn str_list(&self, name: &str) -> Result<Vec<String>, ValidationError> {
        match self.get(name)? {
            ParamValue::Absent => Ok(Vec::new()),
            ParamValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ParamValue::Str(s) => Ok(s.clone()),
                    other => Err(self.mismatch(name, ParamType::Str, other)),
                })
                .collect(),
            other => Err(self.mismatch(name, ParamType::Str, other)),
        }
    }
}

/// Check the `"[datastore] relative/path"` syntax.
///
/// Only one malformed shape is rejected: a path that does not open with `[`
/// but still carries the `"] "` delimiter.
pub fn validate_datastore_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('[') && path.contains("] ") {
        return Err(ValidationError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Split `"[datastore] relative/path"` into its datastore and path parts
pub fn parse_datastore_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('[')?;
    let (datastore, relative) = rest.split_once("] ")?;
    Some((datastore, relative))
}

/// Absolute path of a datastore path inside the ESX shell
pub fn datastore_fs_path(path: &str) -> Option<String> {
    parse_datastore_path(path).map(|(ds, rel)| format!("/vmfs/volumes/{}/{}", ds, rel))
}

/// Name of an entity on the ESX host: `<pool>_<name>`
pub fn host_name(name: &str, pool: &str) -> String {
    format!("{}_{}", pool, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: Schema = Schema {
        entity: "sample",
        params: &[
            Param::required("a", ParamType::Int),
            Param::optional("b", ParamType::Str),
        ],
    };

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_coerces_and_defaults() {
        let v = validate(&SAMPLE, &mapping("a: \"5\"")).unwrap();
        assert_eq!(v.int("a").unwrap(), 5);
        assert_eq!(v.opt_str("b").unwrap(), None);
        assert!(v.is_absent("b"));
    }

    #[test]
    fn test_missing_required_names_parameter() {
        let err = validate(&SAMPLE, &Mapping::new()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingParameter { entity: "sample", name: "a".into() }
        );
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate(&SAMPLE, &mapping("a: [1, 2]")).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::TypeMismatch { expected: ParamType::Int, found: "list", .. }
        ));
        let err = validate(&SAMPLE, &mapping("a: 1\nb: {x: 1}")).unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { found: "mapping", .. }));
    }

    #[test]
    fn test_scalar_string_coercion() {
        let v = validate(&SAMPLE, &mapping("a: 1\nb: 12345")).unwrap();
        assert_eq!(v.opt_str("b").unwrap().as_deref(), Some("12345"));
    }

    #[test]
    fn test_lists() {
        const LISTS: Schema = Schema {
            entity: "lists",
            params: &[Param::list("networks", &[ParamType::Str])],
        };
        let v = validate(&LISTS, &mapping("networks: [lan, 42]")).unwrap();
        assert_eq!(v.str_list("networks").unwrap(), vec!["lan", "42"]);

        let err = validate(&LISTS, &mapping("networks: lan")).unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_multi_type_list_is_misconfiguration() {
        const BROKEN: Schema = Schema {
            entity: "broken",
            params: &[Param::list("x", &[ParamType::Str, ParamType::Int])],
        };
        assert!(matches!(
            validate(&BROKEN, &mapping("x: [a]")),
            Err(ValidationError::SchemaMisconfigured { item_types: 2, .. })
        ));
        assert!(matches!(
            validate(&BROKEN, &Mapping::new()),
            Err(ValidationError::SchemaMisconfigured { .. })
        ));
    }

    #[test]
    fn test_extra_keys_are_kept() {
        let v = validate(&SAMPLE, &mapping("a: 1\nifaces: {hw0: {}}")).unwrap();
        assert!(v.extra.contains_key("ifaces"));
        assert!(!v.extra.contains_key("a"));
    }

    #[test]
    fn test_datastore_path() {
        assert!(validate_datastore_path("[datastore1] isos/vyatta.iso").is_ok());
        assert!(validate_datastore_path("isos/vyatta.iso").is_ok());
        assert!(validate_datastore_path("[broken").is_ok());
        assert_eq!(
            validate_datastore_path("datastore1] isos/vyatta.iso"),
            Err(ValidationError::InvalidPath("datastore1] isos/vyatta.iso".into()))
        );
    }

    #[test]
    fn test_parse_datastore_path() {
        assert_eq!(parse_datastore_path("[ds1] lab/r1.iso"), Some(("ds1", "lab/r1.iso")));
        assert_eq!(parse_datastore_path("lab/r1.iso"), None);
        assert_eq!(
            datastore_fs_path("[ds1] serial_ports/lab_r1").as_deref(),
            Some("/vmfs/volumes/ds1/serial_ports/lab_r1")
        );
    }

    #[test]
    fn test_host_name() {
        assert_eq!(host_name("r1", "lab"), "lab_r1");
    }
}
