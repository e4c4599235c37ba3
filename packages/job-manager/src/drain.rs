//! Drain and idle services.
//!
//! `drain` completes when no active jobs remain; `idle` completes when
//! the scheduler has nothing outstanding and nothing is running (pending
//! jobs may still be queued; their count rides in the response). Both
//! completions are deferred through the batch so the caller observes a
//! quiesced, durable state.

use serde_json::json;

use crate::manager::JobManager;
use crate::rpc::{ClientId, Request, Responder, ServiceError};

#[derive(Default)]
pub struct DrainCtx {
    drain_waiters: Vec<Responder>,
    idle_waiters: Vec<Responder>,
}

impl DrainCtx {
    pub fn disconnect(&mut self, client: ClientId) {
        self.drain_waiters.retain(|r| r.client() != client);
        self.idle_waiters.retain(|r| r.client() != client);
    }

    pub fn is_idle_watched(&self) -> bool {
        !self.drain_waiters.is_empty() || !self.idle_waiters.is_empty()
    }
}

impl JobManager {
    pub(crate) fn handle_drain(&mut self, request: &Request) -> Result<(), ServiceError> {
        if !request.cred.owner {
            return Err(ServiceError::Authorization(
                "drain is limited to the instance owner".to_string(),
            ));
        }
        self.drain.drain_waiters.push(request.responder.clone());
        self.drain_check();
        Ok(())
    }

    pub(crate) fn handle_idle(&mut self, request: &Request) -> Result<(), ServiceError> {
        if !request.cred.owner {
            return Err(ServiceError::Authorization(
                "idle is limited to the instance owner".to_string(),
            ));
        }
        self.drain.idle_waiters.push(request.responder.clone());
        self.drain_check();
        Ok(())
    }

    /// Evaluate drain/idle conditions and complete satisfied waiters via
    /// the current batch.
    pub(crate) fn drain_check(&mut self) {
        if !self.drain.is_idle_watched() {
            return;
        }
        if self.jobs.active_count() == 0 {
            for responder in self.drain.drain_waiters.drain(..) {
                self.event.defer_response(responder, json!({}));
            }
        }
        let running = self
            .jobs
            .iter_active()
            .any(|job| matches!(job.state, crate::job::JobState::Run | crate::job::JobState::Cleanup));
        if self.alloc.pending_count == 0 && !running {
            let pending = self.pending_jobs();
            for responder in self.drain.idle_waiters.drain(..) {
                self.event.defer_response(responder, json!({ "pending": pending }));
            }
        }
    }
}
