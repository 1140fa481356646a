//! Task lifecycle: template checks, the stage revalidation cascade, and
//! the referential delete guard.

use crate::models::{Model, SideFx};
use crate::render::merge_templates;
use crate::request_tracker::Tx;
use pewter_schema::{kind, ApiError, Task};

pub(crate) fn validate(tx: &Tx, task: &mut Task) -> SideFx {
    let mut v = std::mem::take(&mut task.validation);
    if task.name.is_empty() {
        v.error("name is required");
    }
    let root = tx.dt().template_root();
    // Task templates render into job actions, so a path is optional.
    let _merged = merge_templates(&root, &task.templates, false, &mut v);
    v.set_valid();
    v.set_useable();
    v.set_available();
    task.validation = v;
    SideFx::default()
}

pub(crate) fn after_save(tx: &mut Tx, task: &Task) {
    let name = task.name.clone();
    super::revalidate_stages(tx, move |s| s.has_task(&name));
}

pub(crate) fn before_delete(tx: &Tx, task: &Task) -> Result<(), ApiError> {
    let mut e = ApiError::new(409, kind::STILL_IN_USE, "tasks", &task.name);
    for item in tx.store("machines").items() {
        if let Model::Machine(m) = &**item {
            if m.has_task(&task.name) {
                e.errorf(format!("machines:{} still uses {}", m.uuid, task.name));
            }
        }
    }
    for item in tx.store("stages").items() {
        if let Model::Stage(s) = &**item {
            if s.has_task(&task.name) {
                e.errorf(format!("stages:{} still uses {}", s.name, task.name));
            }
        }
    }
    e.into_result()
}
