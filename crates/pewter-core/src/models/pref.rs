//! Preference lifecycle. Known names are validated against the objects
//! they point at; the DataTracker's pref cache tracks saves and
//! deletes.

use crate::models::{Model, SideFx};
use crate::request_tracker::Tx;
use pewter_schema::{pref, Pref};

pub(crate) fn validate(tx: &Tx, p: &mut Pref) -> SideFx {
    let mut v = std::mem::take(&mut p.validation);
    if p.name.is_empty() {
        v.error("name is required");
    } else if !pref::known_pref(&p.name) {
        v.error(format!("unknown preference {}", p.name));
    }
    if v.set_valid() {
        match p.name.as_str() {
            pref::DEFAULT_BOOT_ENV => match tx.raw_find("bootenvs", &p.val) {
                None => v.error(format!("bootenv {} does not exist", p.val)),
                Some(o) => {
                    if let Model::BootEnv(env) = &*o {
                        if env.only_unknown {
                            v.error(format!(
                                "bootenv {} is only for unknown machines",
                                p.val
                            ));
                        }
                    }
                }
            },
            pref::UNKNOWN_BOOT_ENV => match tx.raw_find("bootenvs", &p.val) {
                None => v.error(format!("bootenv {} does not exist", p.val)),
                Some(o) => {
                    if let Model::BootEnv(env) = &*o {
                        if !env.only_unknown {
                            v.error(format!(
                                "bootenv {} is not flagged for unknown machines",
                                p.val
                            ));
                        }
                    }
                }
            },
            pref::DEFAULT_STAGE => {
                if !p.val.is_empty()
                    && p.val != "none"
                    && tx.raw_find("stages", &p.val).is_none()
                {
                    v.error(format!("stage {} does not exist", p.val));
                }
            }
            _ => {}
        }
    }
    v.set_useable();
    v.set_available();
    p.validation = v;
    SideFx::default()
}

pub(crate) fn after_save(tx: &mut Tx, p: &Pref) {
    tx.dt().cache_pref(&p.name, &p.val);
}

pub(crate) fn after_delete(tx: &mut Tx, p: &Pref) {
    tx.dt().uncache_pref(&p.name);
}
