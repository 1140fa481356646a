//! Stage lifecycle: referential checks against bootenvs, tasks, and
//! profiles, plus per-machine template rendering.

use crate::models::{Model, SideFx};
use crate::render::{make_renderers, merge_templates};
use crate::request_tracker::{AfterAction, Tx};
use pewter_schema::{kind, pref, ApiError, Stage};

pub(crate) fn validate(tx: &Tx, stage: &mut Stage) -> SideFx {
    let mut v = std::mem::take(&mut stage.validation);
    let mut fx = SideFx::default();
    if stage.name.is_empty() {
        v.error("name is required");
    }
    let root = tx.dt().template_root();
    let merged = merge_templates(&root, &stage.templates, true, &mut v);
    if !v.set_valid() {
        stage.validation = v;
        return fx;
    }

    let mut env_available = true;
    if !stage.boot_env.is_empty() {
        match tx.raw_find("bootenvs", &stage.boot_env) {
            None => v.error(format!("bootenv {} does not exist", stage.boot_env)),
            Some(o) => {
                if let Model::BootEnv(env) = &*o {
                    env_available = env.validation.available;
                }
            }
        }
    }
    for task in &stage.tasks {
        if tx.raw_find("tasks", task).is_none() {
            v.error(format!("task {task} does not exist"));
        }
    }
    for profile in &stage.profiles {
        if tx.raw_find("profiles", profile).is_none() {
            v.error(format!("profile {profile} does not exist"));
        }
    }

    if v.set_useable() && !stage.templates.is_empty() {
        for item in tx.store("machines").items() {
            let Model::Machine(machine) = &**item else {
                continue;
            };
            if machine.stage != stage.name {
                continue;
            }
            fx.renderers.extend(make_renderers(
                tx,
                &stage.name,
                &stage.templates,
                &stage.required_params,
                merged.clone(),
                Some(machine),
                &mut v,
            ));
        }
    }
    if !env_available {
        v.error(format!("bootenv {} is not available", stage.boot_env));
    }
    v.set_available();
    stage.validation = v;
    fx
}

pub(crate) fn after_save(tx: &mut Tx, stage: &Stage, fx: SideFx) {
    if stage.validation.available && !fx.renderers.is_empty() {
        tx.after.push(AfterAction::Register(fx.renderers));
    }
}

pub(crate) fn before_delete(tx: &Tx, stage: &Stage) -> Result<(), ApiError> {
    let mut e = ApiError::new(409, kind::STILL_IN_USE, "stages", &stage.name);
    if tx.pref(pref::DEFAULT_STAGE).as_deref() == Some(stage.name.as_str()) {
        e.errorf(format!(
            "stage {} is the active {}, cannot remove it",
            stage.name,
            pref::DEFAULT_STAGE
        ));
    }
    for item in tx.store("machines").items() {
        if let Model::Machine(m) = &**item {
            if m.stage == stage.name {
                e.errorf(format!("stage {} in use by machine {}", stage.name, m.name));
            }
        }
    }
    e.into_result()
}

pub(crate) fn after_delete(tx: &mut Tx, stage: &Stage) {
    let root = tx.dt().template_root();
    let mut scratch = pewter_schema::Validation::default();
    let merged = merge_templates(&root, &stage.templates, true, &mut scratch);
    let mut paths: Vec<String> = Vec::new();
    for item in tx.store("machines").items() {
        let Model::Machine(machine) = &**item else {
            continue;
        };
        if machine.stage != stage.name {
            continue;
        }
        paths.extend(
            make_renderers(
                tx,
                &stage.name,
                &stage.templates,
                &stage.required_params,
                merged.clone(),
                Some(machine),
                &mut scratch,
            )
            .into_iter()
            .map(|r| r.path),
        );
    }
    if !paths.is_empty() {
        tx.after.push(AfterAction::Deregister(paths));
    }
}
