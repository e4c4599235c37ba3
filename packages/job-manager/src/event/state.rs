//! Job state machine.
//!
//! [`apply`] digests one eventlog entry into job state, flags, and
//! attributes. It is the single authority for transitions, used both on
//! the live post path and when replaying persisted eventlogs at restart.
//! Events never rewind state.

use serde_json::Value;
use thiserror::Error;

use crate::job::{DependencyError, Job, JobFlags, JobState};
use crate::update::apply_path_updates;

use super::entry::EventEntry;

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("event '{event}' not valid in {state} state")]
    WrongState { event: String, state: &'static str },

    #[error("event '{event}' has a malformed context: {reason}")]
    Malformed { event: String, reason: String },

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("dependency '{description}' {problem}")]
    Dependency {
        description: String,
        problem: &'static str,
    },
}

fn wrong_state(entry: &EventEntry, job: &Job) -> StateError {
    StateError::WrongState {
        event: entry.name.clone(),
        state: job.state.name(),
    }
}

fn malformed(entry: &EventEntry, reason: impl Into<String>) -> StateError {
    StateError::Malformed {
        event: entry.name.clone(),
        reason: reason.into(),
    }
}

fn context_i64(entry: &EventEntry, key: &str) -> Result<i64, StateError> {
    entry
        .context
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed(entry, format!("missing integer '{key}'")))
}

fn context_str<'a>(entry: &'a EventEntry, key: &str) -> Result<&'a str, StateError> {
    entry
        .context
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(entry, format!("missing string '{key}'")))
}

/// Apply `entry` to `job`. On success the job's state, flags, and derived
/// attributes reflect the event; on error nothing is modified.
pub fn apply(job: &mut Job, entry: &EventEntry) -> Result<(), StateError> {
    match entry.name.as_str() {
        "submit" => {
            if job.state != JobState::New {
                return Err(wrong_state(entry, job));
            }
            let userid = context_i64(entry, "userid")?;
            let urgency = context_i64(entry, "urgency")?;
            let flags = entry
                .context
                .get("flags")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            job.userid = userid as u32;
            job.urgency = urgency as i32;
            job.flags = JobFlags::from_bits_truncate(flags as u32);
            job.t_submit = entry.timestamp;
            job.state = JobState::Depend;
        }
        "validate" => {
            if job.state != JobState::Depend {
                return Err(wrong_state(entry, job));
            }
            job.validated = true;
        }
        "invalidate" => {
            if job.state != JobState::Depend {
                return Err(wrong_state(entry, job));
            }
            job.end_event = Some(entry.clone());
            job.t_clean = entry.timestamp;
            job.state = JobState::Inactive;
        }
        "dependency-add" => {
            if job.state != JobState::Depend {
                return Err(wrong_state(entry, job));
            }
            let description = context_str(entry, "description")?;
            job.dependencies
                .add(description)
                .map_err(|e| dependency_error(description, e))?;
        }
        "dependency-remove" => {
            if job.state != JobState::Depend {
                return Err(wrong_state(entry, job));
            }
            let description = context_str(entry, "description")?;
            job.dependencies
                .remove(description)
                .map_err(|e| dependency_error(description, e))?;
        }
        "depend" => {
            if job.state != JobState::Depend || !job.dependencies.is_empty() {
                return Err(wrong_state(entry, job));
            }
            job.depend_posted = true;
            job.state = JobState::Priority;
        }
        "priority" => {
            if job.state != JobState::Priority && job.state != JobState::Sched {
                return Err(wrong_state(entry, job));
            }
            job.priority = context_i64(entry, "priority")?;
            if job.state == JobState::Priority {
                job.state = JobState::Sched;
            }
        }
        "urgency" => {
            if !matches!(
                job.state,
                JobState::Depend | JobState::Priority | JobState::Sched
            ) {
                return Err(wrong_state(entry, job));
            }
            job.urgency = context_i64(entry, "urgency")? as i32;
        }
        "flux-restart" => {
            if !matches!(
                job.state,
                JobState::Depend | JobState::Priority | JobState::Sched
            ) {
                return Err(wrong_state(entry, job));
            }
            if job.state == JobState::Sched {
                job.state = JobState::Priority;
            }
        }
        "alloc" => {
            if job.state != JobState::Sched && job.state != JobState::Cleanup {
                return Err(wrong_state(entry, job));
            }
            job.has_resources = true;
            if job.state == JobState::Sched {
                job.state = JobState::Run;
            }
        }
        "free" => {
            if job.state != JobState::Cleanup {
                return Err(wrong_state(entry, job));
            }
            job.has_resources = false;
        }
        "start" => {
            if job.state != JobState::Run {
                return Err(wrong_state(entry, job));
            }
        }
        "release" => {
            if job.state != JobState::Run && job.state != JobState::Cleanup {
                return Err(wrong_state(entry, job));
            }
        }
        "finish" => {
            if job.state != JobState::Run && job.state != JobState::Cleanup {
                return Err(wrong_state(entry, job));
            }
            if job.end_event.is_none() {
                job.end_event = Some(entry.clone());
            }
            if job.state == JobState::Run {
                job.state = JobState::Cleanup;
            }
        }
        "exception" => {
            if job.state == JobState::New || job.state == JobState::Inactive {
                return Err(wrong_state(entry, job));
            }
            let severity = context_i64(entry, "severity")?;
            if !(0..=7).contains(&severity) {
                return Err(malformed(entry, "severity out of range"));
            }
            if severity == 0 {
                if job.end_event.is_none() {
                    job.end_event = Some(entry.clone());
                }
                job.state = JobState::Cleanup;
            }
        }
        "clean" => {
            if job.state != JobState::Cleanup {
                return Err(wrong_state(entry, job));
            }
            job.t_clean = entry.timestamp;
            job.state = JobState::Inactive;
        }
        "set-flags" => {
            let names = entry
                .context
                .get("flags")
                .and_then(Value::as_array)
                .ok_or_else(|| malformed(entry, "missing 'flags' array"))?;
            let mut flags = job.flags;
            for name in names {
                let name = name
                    .as_str()
                    .ok_or_else(|| malformed(entry, "flag name is not a string"))?;
                match JobFlags::parse_one(name) {
                    Some(flag) => flags |= flag,
                    None => return Err(malformed(entry, format!("unknown flag '{name}'"))),
                }
            }
            job.flags = flags;
        }
        "jobspec-update" => {
            if job.state == JobState::New || job.state == JobState::Inactive {
                return Err(wrong_state(entry, job));
            }
            let updates = entry
                .context
                .as_object()
                .ok_or_else(|| malformed(entry, "context is not an object"))?;
            apply_path_updates(&mut job.jobspec, updates);
            if updates.contains_key("attributes.system.queue") {
                job.queue = job
                    .jobspec
                    .pointer("/attributes/system/queue")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        "resource-update" => {
            if job.state != JobState::Run {
                return Err(wrong_state(entry, job));
            }
            if let Some(expiration) = entry.context.get("expiration") {
                if let Some(resources) = job.resources.as_mut() {
                    set_expiration(resources, expiration.clone());
                }
            }
        }
        "prolog-start" => {
            if job.state != JobState::Run || job.start_pending {
                return Err(wrong_state(entry, job));
            }
            job.perilog_active += 1;
        }
        "epilog-start" => {
            if job.state != JobState::Run && job.state != JobState::Cleanup {
                return Err(wrong_state(entry, job));
            }
            job.perilog_active += 1;
        }
        "prolog-finish" | "epilog-finish" => {
            if job.perilog_active == 0 {
                return Err(malformed(entry, "no prolog/epilog active"));
            }
            job.perilog_active -= 1;
        }
        name if name.starts_with("debug.") => {}
        name => return Err(StateError::UnknownEvent(name.to_string())),
    }
    Ok(())
}

fn dependency_error(description: &str, err: DependencyError) -> StateError {
    StateError::Dependency {
        description: description.to_string(),
        problem: match err {
            DependencyError::AlreadyUsed => "has already been used",
            DependencyError::NotFound => "does not exist",
        },
    }
}

fn set_expiration(resources: &mut Value, expiration: Value) {
    if let Some(execution) = resources.get_mut("execution") {
        if let Some(obj) = execution.as_object_mut() {
            obj.insert("expiration".to_string(), expiration);
            return;
        }
    }
    if let Some(obj) = resources.as_object_mut() {
        obj.insert(
            "execution".to_string(),
            serde_json::json!({ "expiration": expiration }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use serde_json::json;

    fn submit_entry() -> EventEntry {
        EventEntry::at(1.0, "submit", json!({"userid": 42, "urgency": 16, "flags": 0}))
    }

    fn job_in(state: JobState) -> Job {
        let mut job = Job::new(JobId(1), 42);
        job.state = state;
        job
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut job = Job::new(JobId(1), 0);
        apply(&mut job, &submit_entry()).unwrap();
        assert_eq!(job.state, JobState::Depend);
        assert_eq!(job.userid, 42);
        assert_eq!(job.t_submit, 1.0);

        apply(&mut job, &EventEntry::at(1.1, "validate", json!({}))).unwrap();
        apply(&mut job, &EventEntry::at(1.2, "depend", json!({}))).unwrap();
        assert_eq!(job.state, JobState::Priority);

        apply(&mut job, &EventEntry::at(1.3, "priority", json!({"priority": 16}))).unwrap();
        assert_eq!(job.state, JobState::Sched);
        assert_eq!(job.priority, 16);

        apply(&mut job, &EventEntry::at(1.4, "alloc", json!({}))).unwrap();
        assert_eq!(job.state, JobState::Run);
        assert!(job.has_resources);

        apply(&mut job, &EventEntry::at(1.5, "finish", json!({"status": 0}))).unwrap();
        assert_eq!(job.state, JobState::Cleanup);
        assert_eq!(job.end_event.as_ref().unwrap().name, "finish");

        apply(&mut job, &EventEntry::at(1.6, "free", json!({}))).unwrap();
        assert!(!job.has_resources);

        apply(&mut job, &EventEntry::at(1.7, "clean", json!({}))).unwrap();
        assert_eq!(job.state, JobState::Inactive);
        assert_eq!(job.t_clean, 1.7);
    }

    #[test]
    fn submit_requires_new_state() {
        let mut job = job_in(JobState::Depend);
        assert!(matches!(
            apply(&mut job, &submit_entry()),
            Err(StateError::WrongState { .. })
        ));
    }

    #[test]
    fn depend_requires_empty_dependency_set() {
        let mut job = job_in(JobState::Depend);
        apply(
            &mut job,
            &EventEntry::at(1.0, "dependency-add", json!({"description": "after:5"})),
        )
        .unwrap();
        assert!(apply(&mut job, &EventEntry::at(1.1, "depend", json!({}))).is_err());
        apply(
            &mut job,
            &EventEntry::at(1.2, "dependency-remove", json!({"description": "after:5"})),
        )
        .unwrap();
        apply(&mut job, &EventEntry::at(1.3, "depend", json!({}))).unwrap();
        assert_eq!(job.state, JobState::Priority);
    }

    #[test]
    fn exception_severity_zero_moves_to_cleanup() {
        let mut job = job_in(JobState::Sched);
        apply(
            &mut job,
            &EventEntry::at(2.0, "exception", json!({"type": "cancel", "severity": 0})),
        )
        .unwrap();
        assert_eq!(job.state, JobState::Cleanup);
        assert_eq!(job.end_event.as_ref().unwrap().name, "exception");
    }

    #[test]
    fn nonfatal_exception_does_not_transition() {
        let mut job = job_in(JobState::Run);
        apply(
            &mut job,
            &EventEntry::at(2.0, "exception", json!({"type": "oom", "severity": 2})),
        )
        .unwrap();
        assert_eq!(job.state, JobState::Run);
        assert!(job.end_event.is_none());
    }

    #[test]
    fn exception_rejected_in_new_and_inactive() {
        for state in [JobState::New, JobState::Inactive] {
            let mut job = job_in(state);
            assert!(apply(
                &mut job,
                &EventEntry::at(2.0, "exception", json!({"severity": 0})),
            )
            .is_err());
        }
    }

    #[test]
    fn alloc_in_cleanup_records_resources_without_run() {
        let mut job = job_in(JobState::Cleanup);
        apply(&mut job, &EventEntry::at(3.0, "alloc", json!({}))).unwrap();
        assert_eq!(job.state, JobState::Cleanup);
        assert!(job.has_resources);
    }

    #[test]
    fn flux_restart_sends_sched_back_to_priority() {
        let mut job = job_in(JobState::Sched);
        apply(&mut job, &EventEntry::at(4.0, "flux-restart", json!({}))).unwrap();
        assert_eq!(job.state, JobState::Priority);

        let mut job = job_in(JobState::Depend);
        apply(&mut job, &EventEntry::at(4.0, "flux-restart", json!({}))).unwrap();
        assert_eq!(job.state, JobState::Depend);
    }

    #[test]
    fn set_flags_accumulates_known_flags_only() {
        let mut job = job_in(JobState::Run);
        apply(
            &mut job,
            &EventEntry::at(5.0, "set-flags", json!({"flags": ["immutable"]})),
        )
        .unwrap();
        assert!(job.is_immutable());
        assert!(apply(
            &mut job,
            &EventEntry::at(5.1, "set-flags", json!({"flags": ["sideways"]})),
        )
        .is_err());
    }

    #[test]
    fn perilog_counter_balances() {
        let mut job = job_in(JobState::Run);
        apply(&mut job, &EventEntry::at(6.0, "prolog-start", json!({}))).unwrap();
        assert_eq!(job.perilog_active, 1);
        apply(&mut job, &EventEntry::at(6.1, "prolog-finish", json!({}))).unwrap();
        assert_eq!(job.perilog_active, 0);
        assert!(apply(&mut job, &EventEntry::at(6.2, "prolog-finish", json!({}))).is_err());
    }

    #[test]
    fn prolog_rejected_after_start_sent() {
        let mut job = job_in(JobState::Run);
        job.start_pending = true;
        assert!(apply(&mut job, &EventEntry::at(6.0, "prolog-start", json!({}))).is_err());
    }

    #[test]
    fn unknown_event_is_rejected() {
        let mut job = job_in(JobState::Run);
        assert_eq!(
            apply(&mut job, &EventEntry::at(7.0, "teleport", json!({}))),
            Err(StateError::UnknownEvent("teleport".to_string()))
        );
    }

    #[test]
    fn priority_event_in_sched_keeps_state() {
        let mut job = job_in(JobState::Sched);
        job.priority = 16;
        apply(&mut job, &EventEntry::at(8.0, "priority", json!({"priority": 20}))).unwrap();
        assert_eq!(job.state, JobState::Sched);
        assert_eq!(job.priority, 20);
    }

    #[test]
    fn resource_update_adjusts_expiration() {
        let mut job = job_in(JobState::Run);
        job.resources = Some(json!({"execution": {"expiration": 100.0}}));
        apply(
            &mut job,
            &EventEntry::at(9.0, "resource-update", json!({"expiration": 200.0})),
        )
        .unwrap();
        assert_eq!(
            job.resources.as_ref().unwrap()["execution"]["expiration"],
            json!(200.0)
        );
    }

    #[test]
    fn jobspec_update_applies_path_updates() {
        let mut job = job_in(JobState::Sched);
        job.jobspec = json!({"attributes": {"system": {"duration": 60.0}}});
        apply(
            &mut job,
            &EventEntry::at(
                10.0,
                "jobspec-update",
                json!({"attributes.system.duration": 120.0}),
            ),
        )
        .unwrap();
        assert_eq!(
            job.jobspec["attributes"]["system"]["duration"],
            json!(120.0)
        );
    }
}
