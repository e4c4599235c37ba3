//! Exec service interface.
//!
//! An execution system announces itself with `exec-hello {service}`; from
//! then on every job entering RUN gets a `<service>.start {id, userid}`
//! request whose response stream reports shell startup, task finish
//! status, released targets, and exceptions. A transport error tears the
//! interface down; pending starts resume when a new service says hello.

use serde_json::json;
use tracing::{error, info, warn};

use crate::event::EventFlags;
use crate::manager::JobManager;
use crate::rpc::{Request, ServiceError};
use crate::traits::StartResponse;

#[derive(Default)]
pub struct ExecCtx {
    /// Topic prefix of the registered execution service.
    pub service: Option<String>,
}

impl JobManager {
    /// exec-hello {service}: register the execution service. Refused
    /// while any job has a start request outstanding to the previous
    /// service.
    pub(crate) fn handle_exec_hello(&mut self, request: &Request) -> Result<(), ServiceError> {
        let service = request.key_str("service")?;
        if self.jobs.iter_active().any(|job| job.start_pending) {
            return Err(ServiceError::StateConflict(
                "job shells are still active under the previous exec service".to_string(),
            ));
        }
        info!(service = %service, "exec: hello");
        self.exec.service = Some(service.to_string());
        request.responder.respond(json!({}));
        // Jobs waiting in RUN (including reattach after restart) can now
        // get their start requests.
        for id in self.jobs.active_ids_ordered() {
            if let Err(e) = self.job_action(id) {
                error!(id = %id, "exec hello: action failed: {e}");
            }
        }
        Ok(())
    }

    /// One frame of a start response stream, matched by job id.
    pub async fn handle_start_response(&mut self, response: StartResponse) {
        let id = response.id();
        let Some(job) = self.jobs.active(id) else {
            warn!(id = %id, "start response for inactive job");
            return;
        };
        if !job.start_pending && !job.reattach {
            error!(id = %id, "start response: not requested");
            self.exec_teardown();
            return;
        }
        let result = match response {
            StartResponse::Start { .. } => {
                let job = self.jobs.active_mut(id).expect("job looked up above");
                job.reattach = false;
                self.post_event(id, "start", json!({}), EventFlags::empty())
            }
            StartResponse::Release { ranks, is_final, .. } => {
                if is_final {
                    let job = self.jobs.active_mut(id).expect("job looked up above");
                    job.start_pending = false;
                    job.reattach = false;
                }
                self.post_event(
                    id,
                    "release",
                    json!({ "ranks": ranks, "final": is_final }),
                    EventFlags::empty(),
                )
            }
            StartResponse::Finish { status, .. } => {
                self.post_event(id, "finish", json!({ "status": status }), EventFlags::empty())
            }
            StartResponse::Exception {
                severity,
                exc_type,
                note,
                ..
            } => self.post_exception(id, &exc_type, severity, None, &note),
        };
        if let Err(e) = result {
            error!(id = %id, "start response handling failed: {e}");
        }
        self.drain_sched_queue().await;
        self.run_effects().await;
    }

    /// The host observed a transport-level error on a start response.
    pub fn handle_exec_error(&mut self) {
        self.exec_teardown();
    }

    /// Forget the exec service. Outstanding starts are cleared so they
    /// are re-sent when a new service registers.
    pub(crate) fn exec_teardown(&mut self) {
        if self.exec.service.take().is_some() {
            warn!("exec: teardown");
        }
        for job in self.jobs.iter_active_mut() {
            job.start_pending = false;
        }
    }
}
