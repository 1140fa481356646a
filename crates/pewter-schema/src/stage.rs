use crate::tmpl::TemplateInfo;
use crate::validation::Validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered list of tasks, optionally pinned to a boot environment,
/// with extra profiles mixed into parameter resolution for machines in
/// the stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub boot_env: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_params: Vec<String>,
    #[serde(default)]
    pub reboot: bool,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Stage {
    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|t| t == name)
    }
}
