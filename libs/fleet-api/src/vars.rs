//! Typed execution variables
//!
//! Node and group variables are a string-keyed map of tagged values. Merging is
//! shallow: an override replaces the whole value under a key, nested maps
//! included. Nested maps are never merged key-by-key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Variable map handed to the remote executor
pub type VarMap = BTreeMap<String, VarValue>;

/// A single variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<VarValue>),
    Map(BTreeMap<String, VarValue>),
}

impl VarValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VarValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::String(value.to_string())
    }
}

impl From<String> for VarValue {
    fn from(value: String) -> Self {
        VarValue::String(value)
    }
}

impl From<i64> for VarValue {
    fn from(value: i64) -> Self {
        VarValue::Integer(value)
    }
}

impl From<u16> for VarValue {
    fn from(value: u16) -> Self {
        VarValue::Integer(i64::from(value))
    }
}

impl From<u32> for VarValue {
    fn from(value: u32) -> Self {
        VarValue::Integer(i64::from(value))
    }
}

impl From<bool> for VarValue {
    fn from(value: bool) -> Self {
        VarValue::Bool(value)
    }
}

impl From<Vec<VarValue>> for VarValue {
    fn from(value: Vec<VarValue>) -> Self {
        VarValue::List(value)
    }
}

/// Environment variable passed to execution jobs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Overlay `overrides` on `base`, key by key
pub fn merge_shallow(base: &VarMap, overrides: &VarMap) -> VarMap {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
