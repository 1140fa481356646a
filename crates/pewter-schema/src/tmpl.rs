use crate::validation::Validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A standalone, shareable template. Every Tmpl is merged into the
/// engine's global root template set under its `id`, so any object
/// template can reference it instead of carrying inline contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tmpl {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub contents: String,
    #[serde(flatten)]
    pub validation: Validation,
}

/// A template binding on a bootenv, task, or stage: where the rendered
/// output goes (`path`, itself a template) and what to render, either
/// inline `contents` or a reference to a shared [`Tmpl`] by `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub contents: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}
