//! Data model for the pewter provisioning engine.
//!
//! This crate holds the plain serde types that the engine persists and
//! serves: boot environments, tasks, stages, machines, profiles, params,
//! jobs, preferences, shared templates, and package repositories, along
//! with the tri-level validation state every persisted object carries and
//! the `SecureData` envelope used for encrypted parameter values.

pub mod arch;
pub mod bootenv;
pub mod job;
pub mod machine;
pub mod param;
pub mod pref;
pub mod profile;
pub mod repo;
pub mod secure;
pub mod stage;
pub mod task;
pub mod tmpl;
pub mod validation;

pub use arch::{arch_equal, supported_arch};
pub use bootenv::{ArchInfo, BootEnv, OsInfo};
pub use job::{valid_job_transition, Job, JobState};
pub use machine::Machine;
pub use param::Param;
pub use pref::Pref;
pub use profile::Profile;
pub use repo::Repo;
pub use secure::{SecureData, SecureError};
pub use stage::Stage;
pub use task::Task;
pub use tmpl::{TemplateInfo, Tmpl};
pub use validation::Validation;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds surfaced at the save boundary, one per failure class.
pub mod kind {
    pub const VALIDATION: &str = "ValidationError";
    pub const STILL_IN_USE: &str = "StillInUseError";
    pub const NOT_FOUND: &str = "NotFound";
    pub const CONFLICT: &str = "Conflict";
    pub const BAD_REQUEST: &str = "BadRequest";
    pub const PATCH: &str = "PatchError";
    pub const INTERNAL: &str = "Internal";
}

/// Structured error returned from engine CRUD boundaries.
///
/// Carries an HTTP-shaped status code, the failure kind, the object
/// prefix and key it concerns, and accumulated messages. Validation
/// failures copy the object's accumulated errors into `messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub kind: String,
    pub model: String,
    pub key: String,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl ApiError {
    pub fn new(code: u16, kind: &str, model: &str, key: &str) -> Self {
        Self {
            code,
            kind: kind.to_owned(),
            model: model.to_owned(),
            key: key.to_owned(),
            messages: Vec::new(),
        }
    }

    pub fn not_found(model: &str, key: &str) -> Self {
        let mut e = Self::new(404, kind::NOT_FOUND, model, key);
        e.errorf("not found");
        e
    }

    pub fn conflict(model: &str, key: &str) -> Self {
        let mut e = Self::new(409, kind::CONFLICT, model, key);
        e.errorf("already exists");
        e
    }

    pub fn bad_request(model: &str, key: &str, msg: impl Into<String>) -> Self {
        let mut e = Self::new(400, kind::BAD_REQUEST, model, key);
        e.errorf(msg);
        e
    }

    pub fn internal(model: &str, key: &str, msg: impl Into<String>) -> Self {
        let mut e = Self::new(500, kind::INTERNAL, model, key);
        e.errorf(msg);
        e
    }

    /// Build a 422 carrying the object's accumulated validation errors.
    pub fn validation(model: &str, key: &str, messages: &[String]) -> Self {
        let mut e = Self::new(422, kind::VALIDATION, model, key);
        e.messages = messages.to_vec();
        e
    }

    pub fn errorf(&mut self, msg: impl Into<String>) {
        self.messages.push(msg.into());
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Collapse into `Err(self)` when any message accumulated, `Ok(())`
    /// otherwise. Guard-style errors are built empty and filled as
    /// violations are discovered.
    pub fn into_result(self) -> Result<(), ApiError> {
        if self.messages.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind, self.model, self.key)?;
        for m in &self.messages {
            write!(f, "\n  {m}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_guard_is_ok() {
        let e = ApiError::new(409, kind::STILL_IN_USE, "tasks", "t1");
        assert!(e.into_result().is_ok());
    }

    #[test]
    fn filled_guard_is_err() {
        let mut e = ApiError::new(409, kind::STILL_IN_USE, "tasks", "t1");
        e.errorf("stages:stageA still uses t1");
        let err = e.into_result().unwrap_err();
        assert_eq!(err.code, 409);
        assert!(err.to_string().contains("stages:stageA"));
    }

    #[test]
    fn validation_copies_messages() {
        let msgs = vec!["missing kernel".to_owned()];
        let e = ApiError::validation("bootenvs", "ubuntu", &msgs);
        assert_eq!(e.code, 422);
        assert_eq!(e.messages, msgs);
    }

    #[test]
    fn serde_roundtrip() {
        let e = ApiError::not_found("machines", "m1");
        let json = serde_json::to_string(&e).unwrap();
        let back: ApiError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
