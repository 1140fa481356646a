//! Job lifecycle: reference checks and the execution state machine.

use crate::models::SideFx;
use crate::request_tracker::Tx;
use pewter_schema::{kind, valid_job_transition, ApiError, Job, JobState};

pub(crate) fn fill(job: &mut Job) {
    if job.uuid.is_nil() {
        job.uuid = uuid::Uuid::new_v4();
    }
    match job.state {
        JobState::Running if job.start_time.is_empty() => {
            job.start_time = chrono::Utc::now().to_rfc3339();
        }
        JobState::Failed | JobState::Finished | JobState::Incomplete
            if job.end_time.is_empty() =>
        {
            job.end_time = chrono::Utc::now().to_rfc3339();
        }
        _ => {}
    }
}

pub(crate) fn validate(tx: &Tx, job: &mut Job) -> SideFx {
    let mut v = std::mem::take(&mut job.validation);
    if job.machine.is_nil() {
        v.error("machine is required");
    }
    if job.task.is_empty() {
        v.error("task is required");
    }
    if v.set_valid() {
        if tx
            .raw_find("machines", &job.machine.to_string())
            .is_none()
        {
            v.error(format!("machine {} does not exist", job.machine));
        }
        if tx.raw_find("tasks", &job.task).is_none() {
            v.error(format!("task {} does not exist", job.task));
        }
        if !job.stage.is_empty() && tx.raw_find("stages", &job.stage).is_none() {
            v.error(format!("stage {} does not exist", job.stage));
        }
        if let Some(prev) = tx.store("jobs").find(&job.uuid.to_string()) {
            if let crate::models::Model::Job(old) = &**prev {
                if !valid_job_transition(old.state, job.state) {
                    v.error(format!(
                        "invalid state transition {} -> {}",
                        old.state, job.state
                    ));
                }
            }
        }
    }
    v.set_useable();
    v.set_available();
    job.validation = v;
    SideFx::default()
}

pub(crate) fn before_delete(job: &Job) -> Result<(), ApiError> {
    let mut e = ApiError::new(409, kind::STILL_IN_USE, "jobs", &job.uuid.to_string());
    if job.current && job.state == JobState::Running {
        e.errorf(format!("job {} is still running", job.uuid));
    }
    e.into_result()
}
