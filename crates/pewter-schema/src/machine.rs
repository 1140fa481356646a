use crate::validation::Validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A piece of hardware (or a VM) under management, identified by UUID
/// and its MAC addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub boot_env: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hardware_addrs: Vec<String>,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub runnable: bool,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            name: String::new(),
            description: String::new(),
            boot_env: String::new(),
            stage: String::new(),
            profiles: Vec::new(),
            params: BTreeMap::new(),
            tasks: Vec::new(),
            hardware_addrs: Vec::new(),
            arch: String::new(),
            runnable: false,
            validation: Validation::default(),
        }
    }
}

impl Machine {
    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|t| t == name)
    }

    /// MAC comparison ignores case and separator style.
    pub fn has_mac(&self, mac: &str) -> bool {
        let want = normalize_mac(mac);
        self.hardware_addrs.iter().any(|m| normalize_mac(m) == want)
    }
}

pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase()
}
