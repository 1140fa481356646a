//! Machine lifecycle: identity and reference checks, secure-param
//! enforcement, and rendering against the machine's bootenv.

use crate::models::{Model, SideFx};
use crate::render::{make_renderers, merge_templates};
use crate::request_tracker::{AfterAction, Tx};
use pewter_schema::{kind, supported_arch, ApiError, JobState, Machine, Validation};

pub(crate) fn validate(tx: &Tx, machine: &mut Machine) -> SideFx {
    let mut v = std::mem::take(&mut machine.validation);
    let mut fx = SideFx::default();

    if machine.uuid.is_nil() {
        v.error("uuid is required");
    }
    if machine.name.is_empty() {
        v.error("name is required");
    } else {
        for item in tx.store("machines").items() {
            if let Model::Machine(other) = &**item {
                if other.uuid != machine.uuid && other.name == machine.name {
                    v.error(format!(
                        "name {} already in use by machine {}",
                        machine.name, other.uuid
                    ));
                    break;
                }
            }
        }
    }
    if supported_arch(&machine.arch).is_none() {
        v.error(format!("unsupported architecture {}", machine.arch));
    }
    if !v.set_valid() {
        machine.validation = v;
        return fx;
    }

    if !machine.boot_env.is_empty() {
        match tx.raw_find("bootenvs", &machine.boot_env) {
            None => v.error(format!("bootenv {} does not exist", machine.boot_env)),
            Some(o) => {
                if let Model::BootEnv(env) = &*o {
                    if env.only_unknown {
                        v.error(format!(
                            "bootenv {} does not allow machine assignments",
                            env.name
                        ));
                    }
                }
            }
        }
    }
    if !machine.stage.is_empty() && tx.raw_find("stages", &machine.stage).is_none() {
        v.error(format!("stage {} does not exist", machine.stage));
    }
    for profile in &machine.profiles {
        if tx.raw_find("profiles", profile).is_none() {
            v.error(format!("profile {profile} does not exist"));
        }
    }
    for task in &machine.tasks {
        if tx.raw_find("tasks", task).is_none() {
            v.error(format!("task {task} does not exist"));
        }
    }
    for e in super::check_secure_params(tx, &machine.params) {
        v.error(e);
    }

    if v.set_useable() && !machine.boot_env.is_empty() {
        if let Some(o) = tx.raw_find("bootenvs", &machine.boot_env) {
            if let Model::BootEnv(env) = &*o {
                if env.validation.available {
                    let root = tx.dt().template_root();
                    let mut scratch = Validation::default();
                    let merged = merge_templates(&root, &env.templates, true, &mut scratch);
                    fx.renderers = make_renderers(
                        tx,
                        &env.name,
                        &env.templates,
                        &env.required_params,
                        merged,
                        Some(machine),
                        &mut v,
                    );
                }
            }
        }
    }
    v.set_available();
    machine.validation = v;
    fx
}

pub(crate) fn after_save(tx: &mut Tx, machine: &Machine, fx: SideFx) {
    if machine.validation.available && !fx.renderers.is_empty() {
        tx.after.push(AfterAction::Register(fx.renderers));
    }
}

pub(crate) fn before_delete(tx: &Tx, machine: &Machine) -> Result<(), ApiError> {
    let mut e = ApiError::new(
        409,
        kind::STILL_IN_USE,
        "machines",
        &machine.uuid.to_string(),
    );
    for item in tx.store("jobs").items() {
        if let Model::Job(job) = &**item {
            if job.machine == machine.uuid && job.current && job.state == JobState::Running {
                e.errorf(format!(
                    "job {} is still running on machine {}",
                    job.uuid, machine.name
                ));
            }
        }
    }
    e.into_result()
}

pub(crate) fn after_delete(tx: &mut Tx, machine: &Machine) {
    // Drop this machine's rendered artifacts from its bootenv.
    if !machine.boot_env.is_empty() {
        if let Some(o) = tx.raw_find("bootenvs", &machine.boot_env) {
            if let Model::BootEnv(env) = &*o {
                let root = tx.dt().template_root();
                let mut scratch = Validation::default();
                let merged = merge_templates(&root, &env.templates, true, &mut scratch);
                let paths: Vec<String> = make_renderers(
                    tx,
                    &env.name,
                    &env.templates,
                    &env.required_params,
                    merged,
                    Some(machine),
                    &mut scratch,
                )
                .into_iter()
                .map(|r| r.path)
                .collect();
                if !paths.is_empty() {
                    tx.after.push(AfterAction::Deregister(paths));
                }
            }
        }
    }
    // The machine's key pair goes with it.
    let key = machine.uuid.to_string();
    tx.run_after(move |dt| {
        if let Err(e) = dt.delete_key_for("machines", &key) {
            tracing::warn!("unable to drop key for machines:{key}: {e}");
        }
    });
}
