//! `job.update.attributes.system.queue` handler.
//!
//! Moving a job between queues must also move the constraints that the
//! source queue injected at submit time. The update is refused unless the
//! job's current constraints are exactly what its current queue would
//! have injected (or both are empty), so user-authored constraints are
//! never silently overwritten. A queue change always requires a
//! feasibility check.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::job::{Job, JobState};
use crate::jobtap::{Plugin, UpdateAccept, UpdateOutcome};
use crate::rpc::Credentials;

pub const QUEUE_UPDATE_KEY: &str = "attributes.system.queue";

#[derive(Default)]
pub struct UpdateQueue {
    /// queue name -> required properties, refreshed by conf.update.
    requires: BTreeMap<String, Vec<String>>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn constraints_for(requires: &[String]) -> Option<Value> {
        if requires.is_empty() {
            None
        } else {
            Some(json!({ "properties": requires }))
        }
    }
}

impl Plugin for UpdateQueue {
    fn name(&self) -> &str {
        ".update-queue"
    }

    fn conf_update(&mut self, config: &Config) -> Result<(), String> {
        self.requires = config
            .queues
            .iter()
            .map(|(name, qconf)| (name.clone(), qconf.requires.clone()))
            .collect();
        Ok(())
    }

    fn update(
        &mut self,
        job: &Job,
        key: &str,
        value: &Value,
        _cred: &Credentials,
    ) -> UpdateOutcome {
        if key != QUEUE_UPDATE_KEY {
            return UpdateOutcome::Unhandled;
        }
        if !matches!(
            job.state,
            JobState::Depend | JobState::Priority | JobState::Sched
        ) {
            return UpdateOutcome::Rejected("update of queue for running job is not supported".to_string());
        }
        let new_queue = match value.as_str() {
            Some(name) => name,
            None => return UpdateOutcome::Rejected("queue must be a string".to_string()),
        };
        let new_requires = match self.requires.get(new_queue) {
            Some(requires) => requires.clone(),
            None => {
                return UpdateOutcome::Rejected(format!("queue '{new_queue}' does not exist"));
            }
        };
        if job.queue.as_deref() == Some(new_queue) {
            return UpdateOutcome::Rejected(format!("job is already in queue '{new_queue}'"));
        }

        // The job's current constraints must be untouched since submit.
        let current_requires = job
            .queue
            .as_deref()
            .and_then(|name| self.requires.get(name))
            .cloned()
            .unwrap_or_default();
        let expected = Self::constraints_for(&current_requires);
        let actual = job
            .jobspec
            .pointer("/attributes/system/constraints")
            .cloned();
        if actual != expected {
            return UpdateOutcome::Rejected(
                "job constraints do not match its queue and cannot be updated".to_string(),
            );
        }

        let mut updates = Map::new();
        updates.insert(
            "attributes.system.constraints".to_string(),
            Self::constraints_for(&new_requires).unwrap_or(Value::Null),
        );
        UpdateOutcome::Accepted(UpdateAccept {
            needs_validation: false,
            require_feasibility: true,
            updates: Some(updates),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use serde_json::json;

    fn configured_plugin() -> UpdateQueue {
        let mut plugin = UpdateQueue::new();
        let config = Config::from_value(json!({
            "queues": {
                "batch": {"requires": ["batch"]},
                "debug": {"requires": ["debug"]},
                "open": {},
            }
        }))
        .unwrap();
        plugin.conf_update(&config).unwrap();
        plugin
    }

    fn job_in_queue(queue: &str, constraints: Value) -> Job {
        let mut job = Job::new(JobId(1), 0);
        job.state = JobState::Sched;
        job.queue = Some(queue.to_string());
        job.jobspec = if constraints.is_null() {
            json!({"attributes": {"system": {}}})
        } else {
            json!({"attributes": {"system": {"constraints": constraints}}})
        };
        job
    }

    #[test]
    fn queue_move_rewrites_constraints_and_requires_feasibility() {
        let mut plugin = configured_plugin();
        let job = job_in_queue("batch", json!({"properties": ["batch"]}));
        let outcome = plugin.update(
            &job,
            QUEUE_UPDATE_KEY,
            &json!("debug"),
            &Credentials::owner(0),
        );
        match outcome {
            UpdateOutcome::Accepted(accept) => {
                assert!(accept.require_feasibility);
                assert!(!accept.needs_validation);
                let updates = accept.updates.unwrap();
                assert_eq!(
                    updates["attributes.system.constraints"],
                    json!({"properties": ["debug"]})
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn move_to_unconstrained_queue_clears_constraints() {
        let mut plugin = configured_plugin();
        let job = job_in_queue("batch", json!({"properties": ["batch"]}));
        let outcome = plugin.update(
            &job,
            QUEUE_UPDATE_KEY,
            &json!("open"),
            &Credentials::owner(0),
        );
        match outcome {
            UpdateOutcome::Accepted(accept) => {
                assert_eq!(
                    accept.updates.unwrap()["attributes.system.constraints"],
                    Value::Null
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn hand_edited_constraints_block_the_move() {
        let mut plugin = configured_plugin();
        let job = job_in_queue("batch", json!({"properties": ["batch", "bigmem"]}));
        assert!(matches!(
            plugin.update(&job, QUEUE_UPDATE_KEY, &json!("debug"), &Credentials::owner(0)),
            UpdateOutcome::Rejected(_)
        ));
    }

    #[test]
    fn unknown_target_queue_is_rejected() {
        let mut plugin = configured_plugin();
        let job = job_in_queue("batch", json!({"properties": ["batch"]}));
        assert!(matches!(
            plugin.update(&job, QUEUE_UPDATE_KEY, &json!("gone"), &Credentials::owner(0)),
            UpdateOutcome::Rejected(_)
        ));
    }

    #[test]
    fn running_job_cannot_change_queue() {
        let mut plugin = configured_plugin();
        let mut job = job_in_queue("batch", json!({"properties": ["batch"]}));
        job.state = JobState::Run;
        assert!(matches!(
            plugin.update(&job, QUEUE_UPDATE_KEY, &json!("debug"), &Credentials::owner(0)),
            UpdateOutcome::Rejected(_)
        ));
    }

    #[test]
    fn other_keys_are_left_to_other_plugins() {
        let mut plugin = configured_plugin();
        let job = job_in_queue("batch", json!({"properties": ["batch"]}));
        assert_eq!(
            plugin.update(
                &job,
                "attributes.system.duration",
                &json!(60),
                &Credentials::owner(0)
            ),
            UpdateOutcome::Unhandled
        );
    }
}
