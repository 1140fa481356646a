use crate::validation::Validation;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Execution states of a [`Job`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Created,
    Running,
    Failed,
    Finished,
    Incomplete,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Failed => "failed",
            JobState::Finished => "finished",
            JobState::Incomplete => "incomplete",
        };
        f.write_str(s)
    }
}

/// Whether a job may move between two states. Terminal states only
/// re-enter through a fresh job.
pub fn valid_job_transition(from: JobState, to: JobState) -> bool {
    use JobState::*;
    matches!(
        (from, to),
        (Created, Running)
            | (Created, Failed)
            | (Running, Failed | Finished | Incomplete)
            | (Incomplete, Running)
    ) || from == to
}

/// One execution of a task on a machine within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    #[serde(default)]
    pub machine: Uuid,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub exit_state: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub log_path: String,
    /// The machine's currently-active job.
    #[serde(default)]
    pub current: bool,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            machine: Uuid::nil(),
            task: String::new(),
            stage: String::new(),
            state: JobState::Created,
            exit_state: String::new(),
            start_time: String::new(),
            end_time: String::new(),
            log_path: String::new(),
            current: false,
            validation: Validation::default(),
        }
    }
}
