use crate::validation::Validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named bag of parameter values, attachable to machines and stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub validation: Validation,
}
