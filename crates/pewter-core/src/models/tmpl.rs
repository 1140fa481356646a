//! Shared-template lifecycle. Every save or delete rebuilds the
//! engine's root template set, which later validation passes merge
//! against.

use crate::models::{Model, SideFx};
use crate::render::check_template;
use crate::request_tracker::Tx;
use pewter_schema::{kind, ApiError, Tmpl};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) fn validate(tmpl: &mut Tmpl) -> SideFx {
    let v = &mut tmpl.validation;
    if tmpl.id.is_empty() {
        v.error("id is required");
    }
    if let Err(e) = check_template(&tmpl.contents) {
        v.error(format!("template {} does not parse: {e}", tmpl.id));
    }
    v.set_valid();
    v.set_useable();
    v.set_available();
    SideFx::default()
}

/// Build the root template set from the cached templates, optionally
/// splicing in an object that has not been indexed yet or dropping one
/// that just went away.
pub(crate) fn root_from_items(
    items: &[Arc<Model>],
    extra: Option<&Tmpl>,
    removed: Option<&str>,
) -> Arc<BTreeMap<String, String>> {
    let mut root = BTreeMap::new();
    for item in items {
        if let Model::Tmpl(t) = &**item {
            if removed == Some(t.id.as_str()) {
                continue;
            }
            root.insert(t.id.clone(), t.contents.clone());
        }
    }
    if let Some(t) = extra {
        root.insert(t.id.clone(), t.contents.clone());
    }
    Arc::new(root)
}

pub(crate) fn after_save(tx: &mut Tx, tmpl: &Tmpl) {
    let root = root_from_items(tx.store("templates").items(), Some(tmpl), None);
    tx.dt().set_template_root(root);
}

pub(crate) fn before_delete(tx: &Tx, tmpl: &Tmpl) -> Result<(), ApiError> {
    let mut e = ApiError::new(409, kind::STILL_IN_USE, "templates", &tmpl.id);
    for prefix in ["bootenvs", "stages", "tasks"] {
        for item in tx.store(prefix).items() {
            let infos = match &**item {
                Model::BootEnv(b) => &b.templates,
                Model::Stage(s) => &s.templates,
                Model::Task(t) => &t.templates,
                _ => continue,
            };
            if infos.iter().any(|i| i.id == tmpl.id) {
                e.errorf(format!("{prefix}:{} still uses {}", item.key(), tmpl.id));
            }
        }
    }
    e.into_result()
}

pub(crate) fn after_delete(tx: &mut Tx, tmpl: &Tmpl) {
    let root = root_from_items(tx.store("templates").items(), None, Some(&tmpl.id));
    tx.dt().set_template_root(root);
}
