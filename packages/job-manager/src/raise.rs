//! Exception raising.

use serde_json::json;

use crate::event::EventFlags;
use crate::ids::JobId;
use crate::manager::{Effect, JobManager};
use crate::rpc::{Request, ServiceError};

impl JobManager {
    /// Post an exception event and publish the corresponding
    /// `job-exception` broadcast. Severity 0 is fatal and drives the job
    /// to CLEANUP through the state machine.
    pub(crate) fn post_exception(
        &mut self,
        id: JobId,
        exc_type: &str,
        severity: i64,
        userid: Option<u32>,
        note: &str,
    ) -> Result<(), ServiceError> {
        let mut context = json!({
            "type": exc_type,
            "severity": severity,
            "note": note,
        });
        if let Some(userid) = userid {
            context["userid"] = json!(userid);
        }
        self.post_event(id, "exception", context, EventFlags::empty())?;
        self.effects.push_back(Effect::Publish {
            topic: "job-exception".to_string(),
            payload: json!({ "id": id.0, "type": exc_type, "severity": severity }),
        });
        Ok(())
    }

    /// raise {id, severity, type, note?}
    pub(crate) fn handle_raise(&mut self, request: &Request) -> Result<(), ServiceError> {
        let id = JobId(request.key_u64("id")?);
        let severity = request.key_i64("severity")?;
        let exc_type = request.key_str("type")?.to_string();
        let note = request.opt_str("note")?.unwrap_or("").to_string();
        if !(0..=7).contains(&severity) {
            return Err(ServiceError::proto("severity must be in [0, 7]"));
        }
        if exc_type.is_empty() || exc_type.contains(char::is_whitespace) {
            return Err(ServiceError::proto("type must be a single word"));
        }
        let job = self
            .jobs
            .active(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        if !request.cred.may_act_on(job.userid) {
            return Err(ServiceError::Authorization(
                "guests may only raise exceptions on their own jobs".to_string(),
            ));
        }
        self.post_exception(id, &exc_type, severity, Some(request.cred.userid), &note)?;
        request.responder.respond(json!({}));
        Ok(())
    }
}
