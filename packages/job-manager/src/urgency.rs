//! Urgency control service.

use serde_json::json;

use crate::event::EventFlags;
use crate::ids::JobId;
use crate::job::{JobState, URGENCY_DEFAULT, URGENCY_MAX, URGENCY_MIN};
use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};

impl JobManager {
    /// urgency {id, urgency}: post an urgency event and recompute the
    /// job's priority. Responds with the previous urgency.
    pub(crate) fn handle_urgency(&mut self, request: &Request) -> Result<(), ServiceError> {
        let id = JobId(request.key_u64("id")?);
        let urgency = request.key_i64("urgency")?;
        if !(i64::from(URGENCY_MIN)..=i64::from(URGENCY_MAX)).contains(&urgency) {
            return Err(ServiceError::proto(format!(
                "urgency must be in [{URGENCY_MIN}, {URGENCY_MAX}]"
            )));
        }
        let urgency = urgency as i32;
        let job = self
            .jobs
            .active(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        if !request.cred.may_act_on(job.userid) {
            return Err(ServiceError::Authorization(
                "guests may only reprioritize their own jobs".to_string(),
            ));
        }
        if !request.cred.owner && urgency > URGENCY_DEFAULT {
            return Err(ServiceError::Authorization(format!(
                "guests may not set urgency above {URGENCY_DEFAULT}"
            )));
        }
        if !matches!(
            job.state,
            JobState::Depend | JobState::Priority | JobState::Sched
        ) {
            return Err(ServiceError::StateConflict(format!(
                "urgency cannot be changed in {} state",
                job.state.name()
            )));
        }
        let old_urgency = job.urgency;
        if urgency != old_urgency {
            self.post_event(
                id,
                "urgency",
                json!({ "urgency": urgency, "userid": request.cred.userid }),
                EventFlags::empty(),
            )?;
            self.reprioritize_one(id)?;
        }
        request
            .responder
            .respond(json!({ "old_urgency": old_urgency }));
        Ok(())
    }
}
