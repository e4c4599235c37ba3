//! `job.update.attributes.system.duration` handler.
//!
//! Accepts a non-negative number of seconds (0 means unlimited). Updates
//! requested by anyone other than the instance owner are re-validated
//! against the full plugin stack; owner updates skip validation, which in
//! turn freezes the job via the immutable flag when the job belongs to
//! someone else.

use serde_json::Value;

use crate::job::{Job, JobState};
use crate::jobtap::{Plugin, UpdateAccept, UpdateOutcome};
use crate::rpc::Credentials;

pub const DURATION_UPDATE_KEY: &str = "attributes.system.duration";

#[derive(Default)]
pub struct UpdateDuration;

impl UpdateDuration {
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for UpdateDuration {
    fn name(&self) -> &str {
        ".update-duration"
    }

    fn update(
        &mut self,
        job: &Job,
        key: &str,
        value: &Value,
        cred: &Credentials,
    ) -> UpdateOutcome {
        if key != DURATION_UPDATE_KEY {
            return UpdateOutcome::Unhandled;
        }
        let duration = match value.as_f64() {
            Some(duration) if duration >= 0.0 => duration,
            _ => {
                return UpdateOutcome::Rejected(
                    "duration must be a non-negative number of seconds".to_string(),
                );
            }
        };
        if job.state == JobState::Run && duration != 0.0 {
            // Shrinking below time already used makes no sense; the
            // scheduler arbitrates the rest via sched.expiration.
            if let Some(starttime) = job
                .resources
                .as_ref()
                .and_then(|r| r.pointer("/execution/starttime"))
                .and_then(Value::as_f64)
            {
                if starttime + duration < crate::event::now_timestamp() {
                    return UpdateOutcome::Rejected(
                        "requested duration has already expired".to_string(),
                    );
                }
            }
        }
        UpdateOutcome::Accepted(UpdateAccept {
            needs_validation: !cred.owner,
            require_feasibility: false,
            updates: None,
        })
    }
}
