//! Profile lifecycle.

use crate::models::{Model, SideFx};
use crate::request_tracker::Tx;
use pewter_schema::{kind, ApiError, Profile};

pub(crate) fn validate(tx: &Tx, profile: &mut Profile) -> SideFx {
    let mut v = std::mem::take(&mut profile.validation);
    if profile.name.is_empty() {
        v.error("name is required");
    }
    if v.set_valid() {
        for e in super::check_secure_params(tx, &profile.params) {
            v.error(e);
        }
    }
    v.set_useable();
    v.set_available();
    profile.validation = v;
    SideFx::default()
}

pub(crate) fn before_delete(tx: &Tx, profile: &Profile) -> Result<(), ApiError> {
    let mut e = ApiError::new(409, kind::STILL_IN_USE, "profiles", &profile.name);
    if profile.name == tx.dt().global_profile() {
        e.errorf("cannot remove the global profile");
    }
    for item in tx.store("machines").items() {
        if let Model::Machine(m) = &**item {
            if m.profiles.iter().any(|p| p == &profile.name) {
                e.errorf(format!(
                    "profile {} in use by machine {}",
                    profile.name, m.name
                ));
            }
        }
    }
    for item in tx.store("stages").items() {
        if let Model::Stage(s) = &**item {
            if s.profiles.iter().any(|p| p == &profile.name) {
                e.errorf(format!("profile {} in use by stage {}", profile.name, s.name));
            }
        }
    }
    e.into_result()
}

pub(crate) fn after_delete(tx: &mut Tx, profile: &Profile) {
    let name = profile.name.clone();
    tx.run_after(move |dt| {
        if let Err(e) = dt.delete_key_for("profiles", &name) {
            tracing::warn!("unable to drop key for profiles:{name}: {e}");
        }
    });
}
