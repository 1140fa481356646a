//! The engine-side model registry: a tagged variant per prefix plus the
//! capability surface the RequestTracker drives: key/prefix resolution,
//! defaulting, validation dispatch, save/delete hooks, per-action lock
//! declarations, and index makers.

pub mod bootenv;
pub mod job;
pub mod machine;
pub mod param;
pub mod pref;
pub mod profile;
pub mod stage;
pub mod task;
pub mod tmpl;

use crate::fs::Lookaside;
use crate::index::Maker;
use crate::render::Renderer;
use crate::request_tracker::Tx;
use pewter_schema::{ApiError, ArchInfo, Repo, SecureData, Validation};
use serde_json::Value;
use std::collections::BTreeMap;

/// A persisted object, tagged by prefix.
#[derive(Debug, Clone)]
pub enum Model {
    BootEnv(pewter_schema::BootEnv),
    Job(pewter_schema::Job),
    Machine(pewter_schema::Machine),
    Param(pewter_schema::Param),
    Pref(pewter_schema::Pref),
    Profile(pewter_schema::Profile),
    Stage(pewter_schema::Stage),
    Task(pewter_schema::Task),
    Tmpl(pewter_schema::Tmpl),
}

/// Side products of one validation pass, consumed by the save hooks.
#[derive(Default)]
pub(crate) struct SideFx {
    pub renderers: Vec<Renderer>,
    pub lookasides: Vec<(String, Lookaside)>,
    pub real_arches: BTreeMap<String, ArchInfo>,
    pub install_repos: BTreeMap<String, Repo>,
}

/// Order in which prefixes are revalidated at startup: dependencies
/// before dependents.
pub(crate) const VALIDATION_ORDER: &[&str] = &[
    "templates",
    "params",
    "profiles",
    "tasks",
    "stages",
    "bootenvs",
    "machines",
    "preferences",
    "jobs",
];

macro_rules! each_model {
    ($self:expr, $v:ident => $e:expr) => {
        match $self {
            Model::BootEnv($v) => $e,
            Model::Job($v) => $e,
            Model::Machine($v) => $e,
            Model::Param($v) => $e,
            Model::Pref($v) => $e,
            Model::Profile($v) => $e,
            Model::Stage($v) => $e,
            Model::Task($v) => $e,
            Model::Tmpl($v) => $e,
        }
    };
}

impl Model {
    /// Empty skeleton for a prefix.
    pub fn new(prefix: &str) -> Result<Model, ApiError> {
        match prefix {
            "bootenvs" => Ok(Model::BootEnv(Default::default())),
            "jobs" => Ok(Model::Job(Default::default())),
            "machines" => Ok(Model::Machine(Default::default())),
            "params" => Ok(Model::Param(Default::default())),
            "preferences" => Ok(Model::Pref(Default::default())),
            "profiles" => Ok(Model::Profile(Default::default())),
            "stages" => Ok(Model::Stage(Default::default())),
            "tasks" => Ok(Model::Task(Default::default())),
            "templates" => Ok(Model::Tmpl(Default::default())),
            other => Err(ApiError::bad_request(
                other,
                "",
                format!("unknown prefix {other}"),
            )),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Model::BootEnv(_) => "bootenvs",
            Model::Job(_) => "jobs",
            Model::Machine(_) => "machines",
            Model::Param(_) => "params",
            Model::Pref(_) => "preferences",
            Model::Profile(_) => "profiles",
            Model::Stage(_) => "stages",
            Model::Task(_) => "tasks",
            Model::Tmpl(_) => "templates",
        }
    }

    pub fn key(&self) -> String {
        match self {
            Model::BootEnv(b) => b.name.clone(),
            Model::Job(j) => {
                if j.uuid.is_nil() {
                    String::new()
                } else {
                    j.uuid.to_string()
                }
            }
            Model::Machine(m) => {
                if m.uuid.is_nil() {
                    String::new()
                } else {
                    m.uuid.to_string()
                }
            }
            Model::Param(p) => p.name.clone(),
            Model::Pref(p) => p.name.clone(),
            Model::Profile(p) => p.name.clone(),
            Model::Stage(s) => s.name.clone(),
            Model::Task(t) => t.name.clone(),
            Model::Tmpl(t) => t.id.clone(),
        }
    }

    pub fn from_json(prefix: &str, data: &[u8]) -> Result<Model, serde_json::Error> {
        Self::from_json_value(prefix, serde_json::from_slice(data)?)
    }

    pub fn from_json_value(prefix: &str, v: Value) -> Result<Model, serde_json::Error> {
        Ok(match prefix {
            "bootenvs" => Model::BootEnv(serde_json::from_value(v)?),
            "jobs" => Model::Job(serde_json::from_value(v)?),
            "machines" => Model::Machine(serde_json::from_value(v)?),
            "params" => Model::Param(serde_json::from_value(v)?),
            "preferences" => Model::Pref(serde_json::from_value(v)?),
            "profiles" => Model::Profile(serde_json::from_value(v)?),
            "stages" => Model::Stage(serde_json::from_value(v)?),
            "tasks" => Model::Task(serde_json::from_value(v)?),
            "templates" => Model::Tmpl(serde_json::from_value(v)?),
            other => {
                return Err(serde::de::Error::custom(format!("unknown prefix {other}")))
            }
        })
    }

    pub fn to_json_value(&self) -> Value {
        each_model!(self, m => serde_json::to_value(m).unwrap_or(Value::Null))
    }

    /// Serialized form for the durable store: validation state cleared
    /// so transient errors never persist.
    pub fn save_clean_value(&self) -> Result<Value, serde_json::Error> {
        let mut clean = self.clone();
        clean.validation_mut().clear();
        each_model!(&clean, m => serde_json::to_value(m))
    }

    pub fn save_clean_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut clean = self.clone();
        clean.validation_mut().clear();
        each_model!(&clean, m => serde_json::to_vec_pretty(m))
    }

    /// Fill defaulted fields before validation.
    pub fn fill(&mut self) {
        match self {
            Model::Machine(m) => {
                if m.uuid.is_nil() {
                    m.uuid = uuid::Uuid::new_v4();
                }
                if m.arch.is_empty() {
                    m.arch = "amd64".to_owned();
                }
            }
            Model::Job(j) => job::fill(j),
            _ => {}
        }
    }

    pub fn validation(&self) -> &Validation {
        each_model!(self, m => &m.validation)
    }

    pub fn validation_mut(&mut self) -> &mut Validation {
        each_model!(self, m => &mut m.validation)
    }

    pub fn clear_validation(&mut self) {
        self.validation_mut().clear();
    }

    /// The object's own parameter bag, for types that carry one.
    pub fn params(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Model::Machine(m) => Some(&m.params),
            Model::Profile(p) => Some(&p.params),
            _ => None,
        }
    }

    pub fn locks(&self, action: &str) -> &'static [&'static str] {
        locks_for(self.prefix(), action)
    }

    pub fn indexes(&self) -> Vec<Maker> {
        makers_for(self.prefix())
    }
}

// --- Per-action lock declarations ---
//
// Every write set is the superset of prefixes its validation cascade
// may touch. Lock acquisition sorts and deduplicates, so order here is
// documentation only.

const FULL_GRAPH: &[&str] = &[
    "bootenvs",
    "machines",
    "params",
    "profiles",
    "stages",
    "tasks",
    "templates",
];

const MACHINE_DELETE: &[&str] = &[
    "bootenvs",
    "jobs",
    "machines",
    "params",
    "profiles",
    "stages",
    "tasks",
    "templates",
];

const PROFILE_GRAPH: &[&str] = &["machines", "params", "profiles", "stages"];
const PREF_GRAPH: &[&str] = &["bootenvs", "preferences", "stages"];
const TMPL_DELETE: &[&str] = &["bootenvs", "stages", "tasks", "templates"];
const JOB_GRAPH: &[&str] = &["jobs", "machines", "stages", "tasks"];

pub fn locks_for(prefix: &str, action: &str) -> &'static [&'static str] {
    match (prefix, action) {
        ("bootenvs", "get") => &["bootenvs"],
        ("bootenvs", _) => FULL_GRAPH,
        ("tasks", "get") => &["tasks", "templates"],
        ("tasks", _) => FULL_GRAPH,
        ("stages", "get") => &["stages"],
        ("stages", _) => FULL_GRAPH,
        ("machines", "get") => &["machines"],
        ("machines", "delete") => MACHINE_DELETE,
        ("machines", _) => FULL_GRAPH,
        ("profiles", "get") => &["profiles"],
        ("profiles", _) => PROFILE_GRAPH,
        ("params", "get") => &["params"],
        ("params", _) => &["params"],
        ("preferences", "get") => &["preferences"],
        ("preferences", _) => PREF_GRAPH,
        ("templates", "get") => &["templates"],
        ("templates", "delete") => TMPL_DELETE,
        ("templates", _) => &["templates"],
        ("jobs", "get") => &["jobs"],
        ("jobs", _) => JOB_GRAPH,
        _ => FULL_GRAPH,
    }
}

// --- Lifecycle dispatch ---

pub(crate) fn validate(tx: &Tx, m: &mut Model) -> SideFx {
    match m {
        Model::BootEnv(b) => bootenv::validate(tx, b),
        Model::Job(j) => job::validate(tx, j),
        Model::Machine(mm) => machine::validate(tx, mm),
        Model::Param(p) => param::validate(p),
        Model::Pref(p) => pref::validate(tx, p),
        Model::Profile(p) => profile::validate(tx, p),
        Model::Stage(s) => stage::validate(tx, s),
        Model::Task(t) => task::validate(tx, t),
        Model::Tmpl(t) => tmpl::validate(t),
    }
}

/// Mutations applied after validation but before the durable write.
pub(crate) fn before_save(m: &mut Model) {
    if let Model::Task(t) = m {
        if !t.has_feature("sane-exit-codes") {
            t.add_feature("original-exit-codes");
        }
    }
}

/// The validation level a type must reach for a write to be accepted.
/// Boot environments save as long as they are structurally valid (an
/// env waiting on its ISO is still worth persisting); everything else
/// must be useable.
pub(crate) fn save_level_ok(m: &Model) -> bool {
    match m {
        Model::BootEnv(b) => b.validation.validated,
        other => other.validation().useable,
    }
}

pub(crate) fn after_save(tx: &mut Tx, m: &Model, fx: SideFx) {
    match m {
        Model::BootEnv(b) => bootenv::after_save(tx, b, fx),
        Model::Machine(mm) => machine::after_save(tx, mm, fx),
        Model::Pref(p) => pref::after_save(tx, p),
        Model::Stage(s) => stage::after_save(tx, s, fx),
        Model::Task(t) => task::after_save(tx, t),
        Model::Tmpl(t) => tmpl::after_save(tx, t),
        _ => {}
    }
}

pub(crate) fn before_delete(tx: &Tx, m: &Model) -> Result<(), ApiError> {
    match m {
        Model::BootEnv(b) => bootenv::before_delete(tx, b),
        Model::Job(j) => job::before_delete(j),
        Model::Machine(mm) => machine::before_delete(tx, mm),
        Model::Profile(p) => profile::before_delete(tx, p),
        Model::Stage(s) => stage::before_delete(tx, s),
        Model::Task(t) => task::before_delete(tx, t),
        Model::Tmpl(t) => tmpl::before_delete(tx, t),
        _ => Ok(()),
    }
}

pub(crate) fn after_delete(tx: &mut Tx, m: &Model) {
    match m {
        Model::BootEnv(b) => bootenv::after_delete(tx, b),
        Model::Machine(mm) => machine::after_delete(tx, mm),
        Model::Pref(p) => pref::after_delete(tx, p),
        Model::Profile(p) => profile::after_delete(tx, p),
        Model::Stage(s) => stage::after_delete(tx, s),
        Model::Tmpl(t) => tmpl::after_delete(tx, t),
        _ => {}
    }
}

/// Re-run validation for every stage matching `pred`, refreshing only
/// the cached state. Runs under the caller's lock set.
pub(crate) fn revalidate_stages(tx: &mut Tx, pred: impl Fn(&pewter_schema::Stage) -> bool) {
    let keys: Vec<String> = tx
        .store("stages")
        .items()
        .iter()
        .filter_map(|o| match &**o {
            Model::Stage(s) if pred(s) => Some(s.name.clone()),
            _ => None,
        })
        .collect();
    for key in keys {
        let mut obj = match tx.store("stages").find(&key) {
            Some(o) => (**o).clone(),
            None => continue,
        };
        tracing::debug!("revalidating stage {key}");
        obj.clear_validation();
        let _ = validate(tx, &mut obj);
        tx.replace_cached("stages", obj);
    }
}

/// Values stored under a secure param definition must be sealed
/// envelopes.
pub(crate) fn check_secure_params(tx: &Tx, params: &BTreeMap<String, Value>) -> Vec<String> {
    let mut errs = Vec::new();
    for (name, val) in params {
        if let Some(pdef) = tx.raw_find("params", name) {
            if let Model::Param(param) = &*pdef {
                if param.secure && serde_json::from_value::<SecureData>(val.clone()).is_err() {
                    errs.push(format!("param {name} must be stored as a sealed envelope"));
                }
            }
        }
    }
    errs
}

// --- Index makers ---

fn bad_key(prefix: &str, key: &str, msg: &str) -> ApiError {
    ApiError::bad_request(prefix, key, msg.to_owned())
}

pub fn makers_for(prefix: &str) -> Vec<Maker> {
    let mut makers = vec![Maker {
        name: "Key",
        unique: true,
        kind: "string",
        key_of: |m| m.key(),
        fill: |_| Err(ApiError::bad_request("", "", "Key index has no skeleton")),
    }];
    match prefix {
        "bootenvs" => {
            makers.push(Maker {
                name: "Name",
                unique: true,
                kind: "string",
                key_of: |m| match m {
                    Model::BootEnv(b) => b.name.clone(),
                    _ => String::new(),
                },
                fill: |s| {
                    let mut b = pewter_schema::BootEnv::default();
                    b.name = s.to_owned();
                    Ok(Model::BootEnv(b))
                },
            });
            makers.push(Maker {
                name: "OsName",
                unique: false,
                kind: "string",
                key_of: |m| match m {
                    Model::BootEnv(b) => b.os.name.clone(),
                    _ => String::new(),
                },
                fill: |s| {
                    let mut b = pewter_schema::BootEnv::default();
                    b.os.name = s.to_owned();
                    Ok(Model::BootEnv(b))
                },
            });
            makers.push(Maker {
                name: "OnlyUnknown",
                unique: false,
                kind: "boolean",
                key_of: |m| match m {
                    Model::BootEnv(b) => b.only_unknown.to_string(),
                    _ => String::new(),
                },
                fill: |s| match s {
                    "true" | "false" => {
                        let mut b = pewter_schema::BootEnv::default();
                        b.only_unknown = s == "true";
                        Ok(Model::BootEnv(b))
                    }
                    _ => Err(bad_key("bootenvs", s, "OnlyUnknown must be true or false")),
                },
            });
        }
        "machines" => {
            makers.push(Maker {
                name: "Uuid",
                unique: true,
                kind: "uuid",
                key_of: |m| m.key(),
                fill: |s| {
                    let parsed = uuid::Uuid::parse_str(s)
                        .map_err(|_| bad_key("machines", s, "Uuid must be a valid UUID"))?;
                    let mut m = pewter_schema::Machine::default();
                    m.uuid = parsed;
                    Ok(Model::Machine(m))
                },
            });
            makers.push(Maker {
                name: "Name",
                unique: true,
                kind: "string",
                key_of: |m| match m {
                    Model::Machine(m) => m.name.clone(),
                    _ => String::new(),
                },
                fill: |s| {
                    let mut m = pewter_schema::Machine::default();
                    m.name = s.to_owned();
                    Ok(Model::Machine(m))
                },
            });
            makers.push(Maker {
                name: "BootEnv",
                unique: false,
                kind: "string",
                key_of: |m| match m {
                    Model::Machine(m) => m.boot_env.clone(),
                    _ => String::new(),
                },
                fill: |s| {
                    let mut m = pewter_schema::Machine::default();
                    m.boot_env = s.to_owned();
                    Ok(Model::Machine(m))
                },
            });
            makers.push(Maker {
                name: "Stage",
                unique: false,
                kind: "string",
                key_of: |m| match m {
                    Model::Machine(m) => m.stage.clone(),
                    _ => String::new(),
                },
                fill: |s| {
                    let mut m = pewter_schema::Machine::default();
                    m.stage = s.to_owned();
                    Ok(Model::Machine(m))
                },
            });
        }
        "stages" => {
            makers.push(Maker {
                name: "Name",
                unique: true,
                kind: "string",
                key_of: |m| m.key(),
                fill: |s| {
                    let mut st = pewter_schema::Stage::default();
                    st.name = s.to_owned();
                    Ok(Model::Stage(st))
                },
            });
            makers.push(Maker {
                name: "BootEnv",
                unique: false,
                kind: "string",
                key_of: |m| match m {
                    Model::Stage(s) => s.boot_env.clone(),
                    _ => String::new(),
                },
                fill: |s| {
                    let mut st = pewter_schema::Stage::default();
                    st.boot_env = s.to_owned();
                    Ok(Model::Stage(st))
                },
            });
        }
        "jobs" => {
            makers.push(Maker {
                name: "Uuid",
                unique: true,
                kind: "uuid",
                key_of: |m| m.key(),
                fill: |s| {
                    let parsed = uuid::Uuid::parse_str(s)
                        .map_err(|_| bad_key("jobs", s, "Uuid must be a valid UUID"))?;
                    let mut j = pewter_schema::Job::default();
                    j.uuid = parsed;
                    Ok(Model::Job(j))
                },
            });
            makers.push(Maker {
                name: "Machine",
                unique: false,
                kind: "uuid",
                key_of: |m| match m {
                    Model::Job(j) => j.machine.to_string(),
                    _ => String::new(),
                },
                fill: |s| {
                    let parsed = uuid::Uuid::parse_str(s)
                        .map_err(|_| bad_key("jobs", s, "Machine must be a valid UUID"))?;
                    let mut j = pewter_schema::Job::default();
                    j.machine = parsed;
                    Ok(Model::Job(j))
                },
            });
            makers.push(Maker {
                name: "State",
                unique: false,
                kind: "string",
                key_of: |m| match m {
                    Model::Job(j) => j.state.to_string(),
                    _ => String::new(),
                },
                fill: |s| {
                    let state = serde_json::from_value(serde_json::Value::String(s.to_owned()))
                        .map_err(|_| bad_key("jobs", s, "State is not a job state"))?;
                    let mut j = pewter_schema::Job::default();
                    j.state = state;
                    Ok(Model::Job(j))
                },
            });
        }
        // The remaining prefixes key on a single unique name.
        "tasks" | "profiles" | "params" | "preferences" | "templates" => {
            let fill: fn(&str) -> Result<Model, ApiError> = match prefix {
                "tasks" => |s| {
                    let mut t = pewter_schema::Task::default();
                    t.name = s.to_owned();
                    Ok(Model::Task(t))
                },
                "profiles" => |s| {
                    let mut p = pewter_schema::Profile::default();
                    p.name = s.to_owned();
                    Ok(Model::Profile(p))
                },
                "params" => |s| {
                    let mut p = pewter_schema::Param::default();
                    p.name = s.to_owned();
                    Ok(Model::Param(p))
                },
                "preferences" => |s| {
                    let mut p = pewter_schema::Pref::default();
                    p.name = s.to_owned();
                    Ok(Model::Pref(p))
                },
                _ => |s| {
                    let mut t = pewter_schema::Tmpl::default();
                    t.id = s.to_owned();
                    Ok(Model::Tmpl(t))
                },
            };
            makers.push(Maker {
                name: "Name",
                unique: true,
                kind: "string",
                key_of: |m| m.key(),
                fill,
            });
        }
        _ => {}
    }
    makers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_key_roundtrip() {
        for prefix in crate::PREFIXES {
            let m = Model::new(prefix).unwrap();
            assert_eq!(m.prefix(), *prefix);
        }
    }

    #[test]
    fn unknown_prefix_rejected() {
        assert!(Model::new("widgets").is_err());
    }

    #[test]
    fn machine_fill_generates_uuid_and_arch() {
        let mut m = Model::new("machines").unwrap();
        assert!(m.key().is_empty());
        m.fill();
        assert!(!m.key().is_empty());
        if let Model::Machine(machine) = &m {
            assert_eq!(machine.arch, "amd64");
        }
    }

    #[test]
    fn save_clean_strips_validation() {
        let mut m = Model::new("tasks").unwrap();
        if let Model::Task(t) = &mut m {
            t.name = "t".to_owned();
        }
        m.validation_mut().error("boom");
        let v = m.save_clean_value().unwrap();
        assert_eq!(v.get("errors"), None);
    }

    #[test]
    fn lock_sets_cover_cascade() {
        let locks = locks_for("bootenvs", "update");
        for needed in ["stages", "machines", "profiles", "params", "templates"] {
            assert!(locks.contains(&needed), "bootenv update must lock {needed}");
        }
        assert_eq!(locks_for("bootenvs", "get"), &["bootenvs"][..]);
    }

    #[test]
    fn machine_uuid_maker_validates_keys() {
        let makers = makers_for("machines");
        let uuid_maker = makers.iter().find(|m| m.name == "Uuid").unwrap();
        assert!((uuid_maker.fill)("not-a-uuid").is_err());
        assert!((uuid_maker.fill)("f47ac10b-58cc-4372-a567-0e02b2c3d479").is_ok());
    }

    #[test]
    fn task_feature_defaulting_on_before_save() {
        let mut m = Model::new("tasks").unwrap();
        before_save(&mut m);
        if let Model::Task(t) = &m {
            assert!(t.has_feature("original-exit-codes"));
        }
        let mut m2 = Model::new("tasks").unwrap();
        if let Model::Task(t) = &mut m2 {
            t.add_feature("sane-exit-codes");
        }
        before_save(&mut m2);
        if let Model::Task(t) = &m2 {
            assert!(!t.has_feature("original-exit-codes"));
        }
    }
}
