use crate::tmpl::TemplateInfo;
use crate::validation::Validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const FEATURE_KEY: &str = "feature-flags";

/// A named unit of work that runs on a machine as part of a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_params: Vec<String>,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Task {
    /// Feature flags live in `meta["feature-flags"]` as a comma list.
    pub fn has_feature(&self, flag: &str) -> bool {
        self.meta
            .get(FEATURE_KEY)
            .map(|v| v.split(',').any(|f| f.trim() == flag))
            .unwrap_or(false)
    }

    pub fn add_feature(&mut self, flag: &str) {
        if self.has_feature(flag) {
            return;
        }
        let entry = self.meta.entry(FEATURE_KEY.to_owned()).or_default();
        if entry.is_empty() {
            entry.push_str(flag);
        } else {
            entry.push(',');
            entry.push_str(flag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_roundtrip() {
        let mut t = Task::default();
        assert!(!t.has_feature("sane-exit-codes"));
        t.add_feature("original-exit-codes");
        t.add_feature("sane-exit-codes");
        assert!(t.has_feature("original-exit-codes"));
        assert!(t.has_feature("sane-exit-codes"));
        assert_eq!(
            t.meta.get("feature-flags").unwrap(),
            "original-exit-codes,sane-exit-codes"
        );
    }

    #[test]
    fn add_feature_is_idempotent() {
        let mut t = Task::default();
        t.add_feature("sane-exit-codes");
        t.add_feature("sane-exit-codes");
        assert_eq!(t.meta.get("feature-flags").unwrap(), "sane-exit-codes");
    }
}
