//! Jobspec update service.
//!
//! Every requested key is offered to the plugin stack; a key nobody
//! handles is not updatable. Plugins may demand revalidation or a
//! feasibility check and may contribute additional path updates that are
//! applied atomically with the request. Duration changes on a running
//! job are negotiated with the scheduler before anything is posted.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::event::{now_timestamp, EventFlags};
use crate::ids::JobId;
use crate::job::JobState;
use crate::jobtap::UpdateOutcome;
use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};
use crate::traits::ExpirationResult;

pub const DURATION_KEY: &str = "attributes.system.duration";

/// Apply period-delimited path updates to a document, creating
/// intermediate objects. A null value deletes the leaf.
pub fn apply_path_updates(target: &mut Value, updates: &Map<String, Value>) {
    for (path, value) in updates {
        let mut node = &mut *target;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let current = node;
            let Some(obj) = current.as_object_mut() else {
                debug!(path = %path, "path update skipped: intermediate node is not an object");
                break;
            };
            if segments.peek().is_none() {
                if value.is_null() {
                    obj.remove(segment);
                } else {
                    obj.insert(segment.to_string(), value.clone());
                }
                break;
            }
            node = obj
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
}

impl JobManager {
    /// update {id, updates {key: value, ...}}
    pub(crate) async fn handle_update(&mut self, request: &Request) -> Result<(), ServiceError> {
        let id = JobId(request.key_u64("id")?);
        let updates = request
            .key("updates")?
            .as_object()
            .cloned()
            .ok_or_else(|| ServiceError::proto("'updates' is not an object"))?;
        if updates.is_empty() {
            return Err(ServiceError::proto("no updates specified"));
        }
        let job = self
            .jobs
            .active(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        if !request.cred.may_act_on(job.userid) {
            return Err(ServiceError::Authorization(
                "guests may only update their own jobs".to_string(),
            ));
        }
        if job.is_immutable() {
            return Err(ServiceError::Authorization(
                "job is immutable due to previous instance owner update".to_string(),
            ));
        }
        if matches!(job.state, JobState::Cleanup | JobState::Inactive) {
            return Err(ServiceError::StateConflict(format!(
                "update not possible in {} state",
                job.state.name()
            )));
        }
        let job_userid = job.userid;
        let job_state = job.state;

        // Offer each key to the stack, accumulating plugin demands and
        // any additional updates to apply atomically.
        let mut merged_updates = updates.clone();
        let mut needs_validation = false;
        let mut require_feasibility = false;
        for (key, value) in &updates {
            let outcome = {
                let job = self.jobs.active(id).expect("job looked up above");
                self.jobtap.call_update(job, key, value, &request.cred)
            };
            match outcome {
                UpdateOutcome::Unhandled => {
                    return Err(ServiceError::Validation(format!(
                        "update of '{key}' is not supported"
                    )));
                }
                UpdateOutcome::Rejected(errmsg) => {
                    return Err(ServiceError::Validation(errmsg));
                }
                UpdateOutcome::Accepted(accept) => {
                    needs_validation |= accept.needs_validation;
                    require_feasibility |= accept.require_feasibility;
                    if let Some(extra) = accept.updates {
                        for (extra_key, extra_value) in extra {
                            merged_updates.entry(extra_key).or_insert(extra_value);
                        }
                    }
                }
            }
        }

        let mut merged_jobspec = self
            .jobs
            .active(id)
            .expect("job looked up above")
            .jobspec
            .clone();
        apply_path_updates(&mut merged_jobspec, &merged_updates);

        if needs_validation {
            let result = {
                let job = self.jobs.active(id).expect("job looked up above");
                self.jobtap.call_validate(job, &merged_jobspec)
            };
            if let Err(e) = result {
                return Err(ServiceError::Validation(e.errmsg));
            }
        }
        if require_feasibility {
            if let Some(feasibility) = self.feasibility.clone() {
                feasibility
                    .check(&merged_jobspec)
                    .await
                    .map_err(ServiceError::Validation)?;
            }
        }

        // A duration change on a running job must be accepted by the
        // scheduler before it lands in the eventlog.
        let new_expiration = if job_state == JobState::Run
            && merged_updates.contains_key(DURATION_KEY)
        {
            let duration = merged_updates[DURATION_KEY].as_f64().ok_or_else(|| {
                ServiceError::proto("duration must be a number")
            })?;
            let starttime = self
                .jobs
                .active(id)
                .and_then(|job| job.resources.as_ref())
                .and_then(|r| r.pointer("/execution/starttime"))
                .and_then(Value::as_f64)
                .unwrap_or_else(now_timestamp);
            let expiration = if duration == 0.0 {
                0.0
            } else {
                starttime + duration
            };
            match self.sched.expiration(id, expiration).await {
                Ok(ExpirationResult::Accepted) | Ok(ExpirationResult::Unsupported) => {
                    Some(expiration)
                }
                Ok(ExpirationResult::Rejected(errmsg)) => {
                    return Err(ServiceError::Validation(errmsg));
                }
                Err(e) => {
                    return Err(ServiceError::Unavailable(format!(
                        "scheduler expiration update failed: {e}"
                    )));
                }
            }
        } else {
            None
        };

        self.post_event(
            id,
            "jobspec-update",
            Value::Object(merged_updates),
            EventFlags::empty(),
        )?;
        if let Some(expiration) = new_expiration {
            self.post_event(
                id,
                "resource-update",
                json!({ "expiration": expiration }),
                EventFlags::empty(),
            )?;
        }

        // An instance-owner override of another user's job that skipped
        // validation freezes the jobspec from then on.
        if request.cred.owner && request.cred.userid != job_userid && !needs_validation {
            self.post_event(
                id,
                "set-flags",
                json!({ "flags": ["immutable"] }),
                EventFlags::empty(),
            )?;
        }
        request.responder.respond(json!({}));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn path_update_creates_intermediate_objects() {
        let mut doc = json!({});
        apply_path_updates(&mut doc, &map(&[("attributes.system.duration", json!(60))]));
        assert_eq!(doc["attributes"]["system"]["duration"], json!(60));
    }

    #[test]
    fn path_update_overwrites_leaf() {
        let mut doc = json!({"a": {"b": 1}});
        apply_path_updates(&mut doc, &map(&[("a.b", json!(2))]));
        assert_eq!(doc["a"]["b"], json!(2));
    }

    #[test]
    fn null_deletes_leaf() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        apply_path_updates(&mut doc, &map(&[("a.b", Value::Null)]));
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }

    #[test]
    fn scalar_intermediate_is_left_alone() {
        let mut doc = json!({"a": 5});
        apply_path_updates(&mut doc, &map(&[("a.b.c", json!(1))]));
        assert_eq!(doc, json!({"a": 5}));
    }
}
