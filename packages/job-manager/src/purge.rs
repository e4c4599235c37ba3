//! Inactive job purge.
//!
//! Purging drops a job's KVS directory and its in-memory record. The
//! response rides on the batch that commits the unlink. Bulk purge walks
//! inactive jobs oldest-first with age/count limits and refuses large
//! sweeps unless forced.

use serde_json::json;
use tracing::info;

use crate::event::now_timestamp;
use crate::ids::JobId;
use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};

const DEFAULT_PURGE_BATCH: u64 = 50;

impl JobManager {
    /// purge {id} or purge {age_limit?, num_limit?, batch?, force?}
    pub(crate) fn handle_purge(&mut self, request: &Request) -> Result<(), ServiceError> {
        if !request.cred.owner {
            return Err(ServiceError::Authorization(
                "purge is limited to the instance owner".to_string(),
            ));
        }
        if let Some(id) = request.opt_u64("id")? {
            let id = JobId(id);
            if self.jobs.active(id).is_some() {
                return Err(ServiceError::StateConflict(format!(
                    "job {id} is still active"
                )));
            }
            if self.jobs.inactive(id).is_none() {
                return Err(ServiceError::NotFound(format!("job {id} not found")));
            }
            self.purge_one(id);
            self.event
                .defer_response(request.responder.clone(), json!({ "count": 1 }));
            return Ok(());
        }

        let age_limit = request.opt_f64("age_limit")?;
        let num_limit = request.opt_u64("num_limit")?;
        let batch_limit = request.opt_u64("batch")?.unwrap_or(DEFAULT_PURGE_BATCH);
        let force = request.opt_bool("force")?.unwrap_or(false);

        let now = now_timestamp();
        let mut candidates: Vec<(f64, JobId)> = self
            .jobs
            .iter_inactive()
            .filter(|job| {
                age_limit
                    .map(|limit| now - job.t_clean >= limit)
                    .unwrap_or(true)
            })
            .map(|job| (job.t_clean, job.id))
            .collect();
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(limit) = num_limit {
            candidates.truncate(limit as usize);
        }
        if candidates.len() as u64 > batch_limit && !force {
            return Err(ServiceError::StateConflict(format!(
                "refusing to purge {} jobs (batch limit {batch_limit}); use force",
                candidates.len()
            )));
        }
        let count = candidates.len();
        for (_, id) in candidates {
            self.purge_one(id);
        }
        info!(count, "purged inactive jobs");
        self.event
            .defer_response(request.responder.clone(), json!({ "count": count }));
        Ok(())
    }

    fn purge_one(&mut self, id: JobId) {
        self.event.batch().txn.unlink(id.kvs_dir());
        if let Some(job) = self.jobs.remove_inactive(id) {
            self.jobtap.call_destroy(&job);
        }
        self.waits.purge_zombie(id);
    }
}
