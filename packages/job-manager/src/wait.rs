//! Wait service.
//!
//! A job submitted with the WAITABLE flag may be waited on once. Waiting
//! on a specific id blocks until that job goes inactive; waiting on ANY
//! consumes the next waitable job to finish. Finished-but-unwaited jobs
//! are kept as zombies until a waiter collects them. A wait on ANY when
//! there is nothing to wait for fails like `waitpid` with no children.

use serde_json::json;

use crate::ids::JobId;
use crate::manager::JobManager;
use crate::rpc::{ClientId, Request, Responder, ServiceError};

/// Wildcard id: wait for any waitable job.
pub const JOBID_ANY: u64 = u64::MAX;

#[derive(Default)]
pub struct WaitCtx {
    any_waiters: Vec<Responder>,
    zombies: Vec<JobId>,
}

impl WaitCtx {
    pub fn disconnect(&mut self, client: ClientId) {
        self.any_waiters.retain(|r| r.client() != client);
    }

    pub fn zombie_count(&self) -> usize {
        self.zombies.len()
    }

    /// Forget a zombie whose record was purged.
    pub fn purge_zombie(&mut self, id: JobId) {
        self.zombies.retain(|&z| z != id);
    }
}

fn wait_payload(id: JobId, success: bool, errstr: Option<String>) -> serde_json::Value {
    let mut payload = json!({ "id": id.0, "success": success });
    if let Some(errstr) = errstr {
        payload["errstr"] = json!(errstr);
    }
    payload
}

impl JobManager {
    /// wait {id}: respond when the target goes inactive with a result
    /// derived from its end event.
    pub(crate) fn handle_wait(&mut self, request: &Request) -> Result<(), ServiceError> {
        let id = request.key_u64("id")?;
        if id == JOBID_ANY {
            return self.wait_any(request);
        }
        let id = JobId(id);

        // Zombie: the job already finished and is waiting to be reaped.
        if let Some(pos) = self.waits.zombies.iter().position(|&z| z == id) {
            let job = self
                .jobs
                .inactive(id)
                .ok_or_else(|| ServiceError::NotFound(format!("job {id} not found")))?;
            if !request.cred.may_act_on(job.userid) {
                return Err(ServiceError::Authorization(
                    "guests may only wait for their own jobs".to_string(),
                ));
            }
            self.waits.zombies.remove(pos);
            let (success, errstr) = job.wait_result();
            request.responder.respond(wait_payload(id, success, errstr));
            return Ok(());
        }

        let job = self
            .jobs
            .active_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} not found or not waitable")))?;
        if !request.cred.may_act_on(job.userid) {
            return Err(ServiceError::Authorization(
                "guests may only wait for their own jobs".to_string(),
            ));
        }
        if !job.is_waitable() {
            return Err(ServiceError::Validation(format!(
                "job {id} was not submitted with the waitable flag"
            )));
        }
        if job.waiter.is_some() {
            return Err(ServiceError::Validation(format!(
                "job {id} already has a waiter"
            )));
        }
        job.waiter = Some(request.responder.clone());
        Ok(())
    }

    fn wait_any(&mut self, request: &Request) -> Result<(), ServiceError> {
        if let Some(id) = self.waits.zombies.first().copied() {
            self.waits.zombies.remove(0);
            if let Some(job) = self.jobs.inactive(id) {
                let (success, errstr) = job.wait_result();
                request.responder.respond(wait_payload(id, success, errstr));
                return Ok(());
            }
        }
        let waitables = self
            .jobs
            .iter_active()
            .filter(|job| job.is_waitable() && job.waiter.is_none())
            .count();
        if self.waits.any_waiters.len() >= waitables {
            return Err(ServiceError::NoChild(
                "there are no waitable jobs".to_string(),
            ));
        }
        self.waits.any_waiters.push(request.responder.clone());
        Ok(())
    }

    /// Called as a job reaches INACTIVE: answer its waiter, feed an ANY
    /// waiter, or preserve a zombie.
    pub(crate) fn wait_notify_inactive(&mut self, id: JobId) {
        let Some(job) = self.jobs.inactive_mut(id) else {
            return;
        };
        if let Some(waiter) = job.waiter.take() {
            let (success, errstr) = job.wait_result();
            waiter.respond(wait_payload(id, success, errstr));
            return;
        }
        if !job.is_waitable() {
            return;
        }
        let (success, errstr) = job.wait_result();
        if self.waits.any_waiters.is_empty() {
            self.waits.zombies.push(id);
        } else {
            let waiter = self.waits.any_waiters.remove(0);
            waiter.respond(wait_payload(id, success, errstr));
        }
    }
}
