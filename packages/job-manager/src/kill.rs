//! Signal delivery to running jobs.

use serde_json::json;

use crate::ids::JobId;
use crate::job::JobState;
use crate::manager::{Effect, JobManager};
use crate::rpc::{Request, ServiceError};

fn valid_signum(signum: i64) -> Result<i32, ServiceError> {
    if !(1..=64).contains(&signum) {
        return Err(ServiceError::proto("signum out of range"));
    }
    Ok(signum as i32)
}

impl JobManager {
    /// kill {id, signum}: publish a signal event for the job's shells.
    pub(crate) fn handle_kill(&mut self, request: &Request) -> Result<(), ServiceError> {
        let id = JobId(request.key_u64("id")?);
        let signum = valid_signum(request.key_i64("signum")?)?;
        let job = self
            .jobs
            .active(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        if !request.cred.may_act_on(job.userid) {
            return Err(ServiceError::Authorization(
                "guests may only signal their own jobs".to_string(),
            ));
        }
        if !matches!(job.state, JobState::Run | JobState::Cleanup) {
            return Err(ServiceError::StateConflict(format!(
                "job is not running ({} state)",
                job.state.name()
            )));
        }
        self.effects.push_back(Effect::Publish {
            topic: format!("shell-{id}.kill"),
            payload: json!({ "signum": signum }),
        });
        request.responder.respond(json!({}));
        Ok(())
    }

    /// killall {userid?, signum}: signal every running job owned by
    /// `userid` (or every running job, instance owner only).
    pub(crate) fn handle_killall(&mut self, request: &Request) -> Result<(), ServiceError> {
        let signum = valid_signum(request.key_i64("signum")?)?;
        let userid = request.opt_u64("userid")?.map(|u| u as u32);
        if userid.is_none() && !request.cred.owner {
            return Err(ServiceError::Authorization(
                "only the instance owner may signal all jobs".to_string(),
            ));
        }
        if let Some(target) = userid {
            if !request.cred.may_act_on(target) {
                return Err(ServiceError::Authorization(
                    "guests may only signal their own jobs".to_string(),
                ));
            }
        }
        let targets: Vec<JobId> = self
            .jobs
            .iter_active()
            .filter(|job| matches!(job.state, JobState::Run))
            .filter(|job| userid.map(|u| job.userid == u).unwrap_or(true))
            .map(|job| job.id)
            .collect();
        for id in &targets {
            self.effects.push_back(Effect::Publish {
                topic: format!("shell-{id}.kill"),
                payload: json!({ "signum": signum }),
            });
        }
        request
            .responder
            .respond(json!({ "count": targets.len() }));
        Ok(())
    }
}
