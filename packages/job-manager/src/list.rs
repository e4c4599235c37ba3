//! Active job listing.

use serde_json::{json, Value};

use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};

impl JobManager {
    /// list {max_entries}: the head of the scheduling order with a fixed
    /// attribute set.
    pub(crate) fn handle_list(&mut self, request: &Request) -> Result<(), ServiceError> {
        let max_entries = request.key_i64("max_entries")?;
        if max_entries < 0 {
            return Err(ServiceError::proto("max_entries must be >= 0"));
        }
        let mut jobs: Vec<&crate::job::Job> = self.jobs.iter_active().collect();
        jobs.sort_by_key(|job| job.sched_key());
        let entries: Vec<Value> = jobs
            .into_iter()
            .take(max_entries as usize)
            .map(|job| {
                json!({
                    "id": job.id.0,
                    "userid": job.userid,
                    "urgency": job.urgency,
                    "priority": job.priority,
                    "t_submit": job.t_submit,
                    "state": job.state.name(),
                })
            })
            .collect();
        request.responder.respond(json!({ "jobs": entries }));
        Ok(())
    }
}
