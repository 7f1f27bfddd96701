//! Per-invocation options and the flag schema each format declares.
//!
//! A descriptor declares its recognised flags once. Raw `name[=value]` pairs
//! coming from a caller are resolved against that schema before any file is
//! opened, so an unknown flag never reaches the transform step.
use std::collections::BTreeMap;

use crate::{
    digest::DigestAlgorithm,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Bool,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    Bool(bool),
    String(String),
}

impl FlagValue {
    pub fn kind(&self) -> FlagKind {
        match self {
            FlagValue::Bool(_) => FlagKind::Bool,
            FlagValue::String(_) => FlagKind::String,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlagSpec {
    pub name: &'static str,
    pub default: FlagValue,
    pub help: &'static str,
}

impl FlagSpec {
    pub fn bool(name: &'static str, default: bool, help: &'static str) -> Self {
        Self {
            name,
            default: FlagValue::Bool(default),
            help,
        }
    }

    pub fn string(name: &'static str, default: &str, help: &'static str) -> Self {
        Self {
            name,
            default: FlagValue::String(default.to_owned()),
            help,
        }
    }

    pub fn kind(&self) -> FlagKind {
        self.default.kind()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlagSchema {
    specs: Vec<FlagSpec>,
}

impl FlagSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: FlagSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn specs(&self) -> &[FlagSpec] {
        &self.specs
    }

    fn spec(&self, name: &str) -> Option<&FlagSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Resolve raw caller flags into a typed flag set, filling in defaults.
    /// A bare boolean flag (no value) means `true`.
    pub fn resolve<I, K, V>(&self, raw: I) -> Result<Flags>
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut values: BTreeMap<&'static str, FlagValue> = self
            .specs
            .iter()
            .map(|s| (s.name, s.default.clone()))
            .collect();

        for (name, value) in raw {
            let name: &str = name.as_ref();
            let spec = self
                .spec(name)
                .ok_or_else(|| Error::Configuration(format!("unknown flag '{name}'")))?;
            let value: Option<&str> = value.as_ref().map(|v| v.as_ref());
            let resolved = match (spec.kind(), value) {
                (FlagKind::Bool, None) => FlagValue::Bool(true),
                (FlagKind::Bool, Some(v)) => FlagValue::Bool(parse_bool(name, v)?),
                (FlagKind::String, Some(v)) => FlagValue::String(v.to_owned()),
                (FlagKind::String, None) => {
                    return Err(Error::Configuration(format!(
                        "flag '{name}' requires a value"
                    )));
                }
            };
            values.insert(spec.name, resolved);
        }
        Ok(Flags { values })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::Configuration(format!(
            "flag '{name}' expects a boolean, got '{value}'"
        ))),
    }
}

/// Flags resolved against a descriptor's schema. Read-only for the
/// duration of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    values: BTreeMap<&'static str, FlagValue>,
}

impl Flags {
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.values.get(name) {
            Some(FlagValue::Bool(b)) => Ok(*b),
            Some(FlagValue::String(_)) => Err(Error::Configuration(format!(
                "flag '{name}' is not a boolean"
            ))),
            None => Err(Error::Configuration(format!("unknown flag '{name}'"))),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        match self.values.get(name) {
            Some(FlagValue::String(s)) => Ok(s),
            Some(FlagValue::Bool(_)) => Err(Error::Configuration(format!(
                "flag '{name}' is not a string"
            ))),
            None => Err(Error::Configuration(format!("unknown flag '{name}'"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FlagValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }
}

#[derive(Debug, Clone)]
pub struct SignOptions {
    pub digest: DigestAlgorithm,
    pub flags: Flags,
}

impl SignOptions {
    pub fn new(digest: DigestAlgorithm, flags: Flags) -> Self {
        Self { digest, flags }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Skip recomputing the canonical digest; only the signature structure
    /// and certificate are checked.
    pub no_digests: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> FlagSchema {
        FlagSchema::new()
            .with(FlagSpec::bool("no-extended-sig", false, "skip it"))
            .with(FlagSpec::string("description", "", "program name"))
    }

    #[test]
    fn test_defaults_fill_in() {
        let flags = schema().resolve(Vec::<(&str, Option<&str>)>::new()).unwrap();
        assert!(!flags.get_bool("no-extended-sig").unwrap());
        assert_eq!(flags.get_str("description").unwrap(), "");
    }

    #[test]
    fn test_bare_bool_flag_is_true() {
        let flags = schema()
            .resolve([("no-extended-sig", None::<&str>)])
            .unwrap();
        assert!(flags.get_bool("no-extended-sig").unwrap());
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let err = schema().resolve([("no-such-flag", Some("1"))]).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("no-such-flag")));
    }

    #[test]
    fn test_bad_bool_and_missing_string_value() {
        assert!(schema().resolve([("no-extended-sig", Some("maybe"))]).is_err());
        assert!(schema().resolve([("description", None::<&str>)]).is_err());
    }

    #[test]
    fn test_wrong_type_lookup() {
        let flags = schema().resolve([("description", Some("setup"))]).unwrap();
        assert_eq!(flags.get_str("description").unwrap(), "setup");
        assert!(flags.get_bool("description").is_err());
        assert!(flags.get_bool("missing").is_err());
    }
}
