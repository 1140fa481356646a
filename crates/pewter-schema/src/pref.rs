use crate::validation::Validation;
use serde::{Deserialize, Serialize};

/// Well-known preference names the engine interprets.
pub const DEFAULT_BOOT_ENV: &str = "defaultBootEnv";
pub const UNKNOWN_BOOT_ENV: &str = "unknownBootEnv";
pub const DEFAULT_STAGE: &str = "defaultStage";
pub const DEBUG_RENDERER: &str = "debugRenderer";

/// A single global setting, e.g. the bootenv handed to machines the
/// system has never seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pref {
    pub name: String,
    #[serde(default)]
    pub val: String,
    #[serde(flatten)]
    pub validation: Validation,
}

/// Names the engine accepts; anything else is a validation error.
pub fn known_pref(name: &str) -> bool {
    matches!(
        name,
        DEFAULT_BOOT_ENV | UNKNOWN_BOOT_ENV | DEFAULT_STAGE | DEBUG_RENDERER
    )
}
