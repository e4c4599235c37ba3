//! Job submission.
//!
//! Submissions arrive pre-validated by the ingest service in batches.
//! Each entry runs the queue gate, is inserted into the active table, and
//! walks the jobtap chain (create, validate, dependencies, new). The
//! single response is attached to the commit batch so submitted ids are
//! only handed out once their eventlogs are durable; entries that fail
//! produce `[id, message]` pairs in the response's errors array and leave
//! no trace in the KVS.

use serde_json::{json, Value};
use tracing::error;

use crate::event::{now_timestamp, EventEntry, EventFlags};
use crate::ids::JobId;
use crate::job::{Job, JobFlags, URGENCY_DEFAULT, URGENCY_MAX, URGENCY_MIN};
use crate::jobtap::DependencyOutcome;
use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};

/// Severity used for the nonfatal exception raised when no plugin
/// handles a dependency scheme.
const DEPENDENCY_WARN_SEVERITY: i64 = 4;

struct SubmitEntry {
    id: Option<JobId>,
    userid: u32,
    urgency: i32,
    flags: u32,
    t_submit: Option<f64>,
    jobspec: Value,
}

fn decode_entry(entry: &Value, request: &Request) -> Result<SubmitEntry, ServiceError> {
    let jobspec = entry
        .get("jobspec")
        .cloned()
        .ok_or_else(|| ServiceError::proto("submit entry missing 'jobspec'"))?;
    let userid = entry
        .get("userid")
        .and_then(Value::as_u64)
        .map(|u| u as u32)
        .unwrap_or(request.cred.userid);
    let urgency = entry
        .get("urgency")
        .and_then(Value::as_i64)
        .unwrap_or(i64::from(URGENCY_DEFAULT));
    if !(i64::from(URGENCY_MIN)..=i64::from(URGENCY_MAX)).contains(&urgency) {
        return Err(ServiceError::proto("urgency out of range"));
    }
    let flags = entry.get("flags").and_then(Value::as_u64).unwrap_or(0) as u32;
    if JobFlags::from_bits(flags).is_none() {
        return Err(ServiceError::proto("unknown submit flags"));
    }
    Ok(SubmitEntry {
        id: entry.get("id").and_then(Value::as_u64).map(JobId),
        userid,
        urgency: urgency as i32,
        flags,
        t_submit: entry.get("t_submit").and_then(Value::as_f64),
        jobspec,
    })
}

fn jobspec_queue(jobspec: &Value) -> Option<&str> {
    jobspec
        .pointer("/attributes/system/queue")
        .and_then(Value::as_str)
}

/// Merge a queue's required properties into the jobspec constraints,
/// building the attributes tree as needed.
fn merge_queue_requires(jobspec: &mut Value, requires: &[String]) {
    if requires.is_empty() {
        return;
    }
    let Some(obj) = jobspec.as_object_mut() else {
        return;
    };
    let attributes = obj.entry("attributes").or_insert_with(|| json!({}));
    let Some(attributes) = attributes.as_object_mut() else {
        return;
    };
    let system = attributes.entry("system").or_insert_with(|| json!({}));
    let Some(system) = system.as_object_mut() else {
        return;
    };
    let constraints = system
        .entry("constraints")
        .or_insert_with(|| json!({ "properties": [] }));
    let Some(constraints) = constraints.as_object_mut() else {
        return;
    };
    let properties = constraints.entry("properties").or_insert_with(|| json!([]));
    let Some(properties) = properties.as_array_mut() else {
        return;
    };
    for requirement in requires {
        if !properties
            .iter()
            .any(|p| p.as_str() == Some(requirement.as_str()))
        {
            properties.push(json!(requirement));
        }
    }
}

impl JobManager {
    /// submit {jobs: [...]}: admit a batch of jobs. One response, tied to
    /// the eventlog commit.
    pub(crate) fn handle_submit(&mut self, request: &Request) -> Result<(), ServiceError> {
        let raw_entries = request
            .key("jobs")?
            .as_array()
            .ok_or_else(|| ServiceError::proto("'jobs' is not an array"))?;
        // Decode everything up front so a malformed entry rejects the
        // whole request before any job is inserted.
        let entries = raw_entries
            .iter()
            .map(|raw| decode_entry(raw, request))
            .collect::<Result<Vec<_>, _>>()?;
        let mut ids: Vec<u64> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();
        for entry in entries {
            let id = entry.id.unwrap_or_else(|| self.idgen.next());
            match self.submit_one(id, entry) {
                Ok(()) => {
                    ids.push(id.0);
                    self.event.defer_max_jobid(id);
                }
                Err(errmsg) => errors.push(json!([id.0, errmsg])),
            }
        }
        self.event.defer_response(
            request.responder.clone(),
            json!({ "ids": ids, "errors": errors }),
        );
        Ok(())
    }

    fn submit_one(&mut self, id: JobId, entry: SubmitEntry) -> Result<(), String> {
        // Queue gate first; a rejected job is never inserted.
        let requested_queue = jobspec_queue(&entry.jobspec).map(str::to_string);
        let queue = self
            .queues
            .submit_check(requested_queue.as_deref())
            .map_err(|e| e.to_string())?;
        let requires = self.queues.requires(queue.as_deref());

        let mut job = Job::new(id, entry.userid);
        job.queue = queue;
        job.jobspec = entry.jobspec;
        merge_queue_requires(&mut job.jobspec, &requires);
        let jobspec = job.jobspec.clone();
        self.jobs.insert_active(job);

        let t_submit = entry.t_submit.unwrap_or_else(now_timestamp);
        let submit_entry = EventEntry::at(
            t_submit,
            "submit",
            json!({
                "userid": entry.userid,
                "urgency": entry.urgency,
                "flags": entry.flags,
            }),
        );
        if let Err(e) = self.post_entry(id, submit_entry, EventFlags::empty()) {
            self.abandon_submission(id);
            return Err(e.to_string());
        }
        self.event
            .batch()
            .txn
            .put(id.kvs_key("jobspec"), jobspec.clone());

        // jobtap chain: create, validate, dependencies, new.
        let create_result = {
            let job = self.jobs.active(id).expect("job inserted above");
            self.jobtap.call_create(job)
        };
        match create_result {
            Ok(actions) => self.apply_stack_actions(id, actions),
            Err(e) => {
                self.invalidate(id);
                return Err(e.errmsg);
            }
        }
        let validate_result = {
            let job = self.jobs.active(id).expect("job inserted above");
            self.jobtap.call_validate(job, &jobspec)
        };
        if let Err(e) = validate_result {
            self.invalidate(id);
            return Err(e.errmsg);
        }
        if let Err(errmsg) = self.submit_dependencies(id, &jobspec) {
            self.invalidate(id);
            return Err(errmsg);
        }
        let new_result = {
            let job = self.jobs.active(id).expect("job inserted above");
            self.jobtap.call_new(job)
        };
        match new_result {
            Ok(actions) => self.apply_stack_actions(id, actions),
            Err(e) => {
                self.invalidate(id);
                return Err(e.errmsg);
            }
        }
        if let Err(e) = self.post_event(id, "validate", json!({}), EventFlags::empty()) {
            self.invalidate(id);
            return Err(e.to_string());
        }
        Ok(())
    }

    /// Walk `attributes.system.dependencies` and let plugins take each
    /// one. An unhandled scheme leaves the dependency in place and raises
    /// a nonfatal exception; a plugin rejection fails the submission.
    pub(crate) fn submit_dependencies(
        &mut self,
        id: JobId,
        jobspec: &Value,
    ) -> Result<(), String> {
        let Some(dependencies) = jobspec
            .pointer("/attributes/system/dependencies")
            .and_then(Value::as_array)
            .cloned()
        else {
            return Ok(());
        };
        for dependency in &dependencies {
            let scheme = dependency
                .get("scheme")
                .and_then(Value::as_str)
                .ok_or_else(|| "dependency missing scheme".to_string())?
                .to_string();
            let value = dependency.get("value").cloned().unwrap_or(Value::Null);
            let description = match value.as_str() {
                Some(s) => format!("{scheme}:{s}"),
                None => format!("{scheme}:{value}"),
            };
            if let Err(e) = self.post_event(
                id,
                "dependency-add",
                json!({ "description": description }),
                EventFlags::empty(),
            ) {
                return Err(e.to_string());
            }
            let (outcome, actions) = {
                let job = self.jobs.active(id).expect("job is active");
                self.jobtap.call_dependency(job, &scheme, &value)
            };
            self.apply_stack_actions(id, actions);
            match outcome {
                DependencyOutcome::Accepted => {}
                DependencyOutcome::Rejected(errmsg) => return Err(errmsg),
                DependencyOutcome::Unhandled => {
                    if let Err(e) = self.post_exception(
                        id,
                        "dependency",
                        DEPENDENCY_WARN_SEVERITY,
                        None,
                        &format!("dependency scheme \"{scheme}\" not supported"),
                    ) {
                        error!(id = %id, "dependency exception failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// A submission failed after the submit event was posted: post the
    /// ephemeral invalidate event, scrub the KVS writes from the open
    /// batch, and drop the record.
    fn invalidate(&mut self, id: JobId) {
        if let Err(e) = self.post_event(id, "invalidate", json!({}), EventFlags::NO_COMMIT) {
            error!(id = %id, "invalidate failed: {e}");
        }
        self.event.batch().txn.unlink(id.kvs_dir());
        self.abandon_submission(id);
    }

    fn abandon_submission(&mut self, id: JobId) {
        if let Some(job) = self.jobs.lookup(id) {
            self.jobtap.call_destroy(job);
        }
        if self.jobs.active(id).is_some() {
            // invalidate moved it to INACTIVE already unless the submit
            // event itself failed; retire handles both.
            if let Some(job) = self.jobs.active_mut(id) {
                job.state = crate::job::JobState::Inactive;
            }
            self.jobs.retire(id);
        }
        self.jobs.remove_inactive(id);
        self.waits.purge_zombie(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_requires_merge_into_empty_jobspec() {
        let mut jobspec = json!({});
        merge_queue_requires(&mut jobspec, &["batch".to_string()]);
        assert_eq!(
            jobspec.pointer("/attributes/system/constraints"),
            Some(&json!({"properties": ["batch"]}))
        );
    }

    #[test]
    fn queue_requires_extend_existing_properties() {
        let mut jobspec = json!({
            "attributes": {"system": {"constraints": {"properties": ["bigmem"]}}}
        });
        merge_queue_requires(&mut jobspec, &["batch".to_string()]);
        assert_eq!(
            jobspec.pointer("/attributes/system/constraints/properties"),
            Some(&json!(["bigmem", "batch"]))
        );
    }

    #[test]
    fn duplicate_requires_are_not_added_twice() {
        let mut jobspec = json!({
            "attributes": {"system": {"constraints": {"properties": ["batch"]}}}
        });
        merge_queue_requires(&mut jobspec, &["batch".to_string()]);
        assert_eq!(
            jobspec.pointer("/attributes/system/constraints/properties"),
            Some(&json!(["batch"]))
        );
    }

    #[test]
    fn jobspec_queue_extraction() {
        let jobspec = json!({"attributes": {"system": {"queue": "debug"}}});
        assert_eq!(jobspec_queue(&jobspec), Some("debug"));
        assert_eq!(jobspec_queue(&json!({})), None);
    }
}
