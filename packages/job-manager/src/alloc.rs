//! Scheduler interface.
//!
//! Startup handshake: the scheduler sends `sched-hello` and receives every
//! job holding resources (including allocations parked in housekeeping,
//! with their already-released ranks), then `sched-ready {mode}` to open
//! the request flow. Steady state: jobs entering SCHED are queued in the
//! inqueue ordered by (priority desc, id asc); [`JobManager::drain_sched_queue`]
//! turns queue heads into `sched.alloc` requests as the mode admits.
//! Responses are matched by job id. Any transport-level error from the
//! scheduler triggers teardown: pending allocs requeue and everything
//! waits for a new hello.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::event::EventFlags;
use crate::ids::JobId;
use crate::job::{JobFlags, SchedKey};
use crate::manager::{Effect, JobManager, SIGTERM};
use crate::rpc::{Request, ServiceError};
use crate::traits::{AllocRequest, AllocResponse, FreeRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedMode {
    /// At most one outstanding alloc request.
    #[default]
    Single,
    /// Outstanding requests bounded by a fixed ceiling.
    Limited(u32),
    Unlimited,
}

impl SchedMode {
    pub fn name(&self) -> &'static str {
        match self {
            SchedMode::Single => "single",
            SchedMode::Limited(_) => "limited",
            SchedMode::Unlimited => "unlimited",
        }
    }

    fn admits(&self, outstanding: u32) -> bool {
        match self {
            SchedMode::Single => outstanding == 0,
            SchedMode::Limited(limit) => outstanding < *limit,
            SchedMode::Unlimited => true,
        }
    }
}

/// Scheduler-facing state: the inqueue plus handshake bookkeeping.
pub struct AllocCtx {
    pub ready: bool,
    pub mode: SchedMode,
    inqueue: BTreeSet<SchedKey>,
    pub pending_count: u32,
}

impl AllocCtx {
    pub fn new() -> Self {
        Self {
            ready: false,
            mode: SchedMode::default(),
            inqueue: BTreeSet::new(),
            pending_count: 0,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inqueue.len()
    }

    fn insert(&mut self, key: SchedKey) {
        self.inqueue.insert(key);
    }

    fn remove(&mut self, key: &SchedKey) -> bool {
        self.inqueue.remove(key)
    }

    fn head(&self) -> Option<SchedKey> {
        self.inqueue.iter().next().copied()
    }

    pub fn queued_ids(&self) -> Vec<JobId> {
        self.inqueue.iter().map(|key| key.id).collect()
    }

    pub fn stats(&self) -> Value {
        json!({
            "queue_length": self.inqueue.len(),
            "pending_count": self.pending_count,
            "ready": self.ready,
            "mode": self.mode.name(),
        })
    }
}

impl Default for AllocCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    /// sched-hello: report every allocation the scheduler must consider
    /// in use, then retake any actions that were interrupted while the
    /// scheduler was away.
    pub(crate) fn handle_sched_hello(&mut self, request: &Request) -> Result<(), ServiceError> {
        let partial_ok = request.opt_bool("partial-ok")?.unwrap_or(false);
        info!("scheduler: hello");
        let mut entries = Vec::new();
        for job in self.jobs.iter_active() {
            if job.has_resources {
                entries.push(json!({ "id": job.id.0 }));
            }
        }
        let (hk_entries, doomed) = self.housekeeping.hello_entries(partial_ok);
        entries.extend(hk_entries);
        for id in doomed {
            warn!(id = %id,
                "scheduler does not support partial hello; terminating housekeeping");
            self.housekeeping.remove(id);
            self.effects.push_back(Effect::HousekeepingTerminate {
                id,
                signum: SIGTERM,
            });
        }
        request.responder.respond(json!({ "alloc": entries }));

        for id in self.jobs.active_ids_ordered() {
            if let Err(e) = self.job_action(id) {
                error!(id = %id, "hello: action replay failed: {e}");
            }
        }
        Ok(())
    }

    /// sched-ready {mode, limit?}: open the allocation flow.
    pub(crate) fn handle_sched_ready(&mut self, request: &Request) -> Result<(), ServiceError> {
        let mode = match request.key_str("mode")? {
            "single" => SchedMode::Single,
            "unlimited" => SchedMode::Unlimited,
            "limited" => {
                let limit = request.key_u64("limit")?;
                if limit == 0 {
                    return Err(ServiceError::proto("limit must be at least 1"));
                }
                SchedMode::Limited(limit as u32)
            }
            other => {
                return Err(ServiceError::proto(format!("unknown mode '{other}'")));
            }
        };
        self.alloc.mode = mode;
        self.alloc.ready = true;
        info!(mode = mode.name(), "scheduler: ready");
        request
            .responder
            .respond(json!({ "count": self.alloc.queue_len() }));
        Ok(())
    }

    /// Feed the scheduler from the head of the inqueue while the mode
    /// admits another outstanding request. Invoked by the driver after
    /// every message, like the prep/check pair around the original poll.
    pub async fn drain_sched_queue(&mut self) {
        loop {
            if !self.alloc.ready || self.fatal_error().is_some() {
                return;
            }
            if !self.alloc.mode.admits(self.alloc.pending_count) {
                return;
            }
            let Some(key) = self.alloc.head() else {
                return;
            };
            let Some(job) = self.jobs.active(key.id) else {
                // Stale key; the job retired while queued.
                self.alloc.remove(&key);
                continue;
            };
            let request = AllocRequest {
                id: job.id,
                priority: job.priority,
                userid: job.userid,
                t_submit: job.t_submit,
            };
            let debug_flag = job.flags.contains(JobFlags::DEBUG);
            if let Err(e) = self.sched.alloc(request).await {
                warn!(id = %key.id, "sched.alloc failed: {e}");
                self.scheduler_teardown("alloc request error");
                return;
            }
            self.alloc.remove(&key);
            let job = self.jobs.active_mut(key.id).expect("job looked up above");
            job.alloc_queued = false;
            job.alloc_pending = true;
            self.alloc.pending_count += 1;
            if debug_flag {
                let _ = self.post_event(
                    key.id,
                    "debug.alloc-request",
                    json!({}),
                    EventFlags::empty(),
                );
            }
        }
    }

    /// One `sched.alloc` response frame, matched by job id.
    pub async fn handle_alloc_response(&mut self, response: AllocResponse) {
        let id = response.id();
        if self.jobs.active(id).is_none() {
            // A finalized cancel let the job retire before this frame
            // arrived. A grant that raced the cancel is returned whole;
            // anything else is stale and dropped.
            if matches!(response, AllocResponse::Granted { .. }) {
                info!(id = %id, "returning allocation granted after cancel");
                let resources = self
                    .kvs
                    .get(&id.kvs_key("R"))
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(Value::Null);
                self.effects.push_back(Effect::SendFree(FreeRequest {
                    id,
                    resources,
                    ranks: None,
                    is_final: true,
                }));
                self.run_effects().await;
            }
            return;
        }
        let job = self.jobs.active(id).expect("checked above");
        match response {
            AllocResponse::Annotation { annotations, .. } => {
                // Not a final response; the request stays outstanding.
                if let Err(e) = self.annotations_update(id, &annotations) {
                    error!(id = %id, "alloc annotation update failed: {e}");
                }
            }
            AllocResponse::Granted {
                note, annotations, ..
            } => {
                if !job.alloc_pending {
                    error!(id = %id, "sched.alloc response: not requested");
                    self.scheduler_teardown("unsolicited alloc response");
                    return;
                }
                if job.has_resources {
                    error!(id = %id, "sched.alloc response: already allocated");
                    self.scheduler_teardown("duplicate alloc response");
                    return;
                }
                self.alloc.pending_count = self.alloc.pending_count.saturating_sub(1);
                let resources = match self.kvs.get(&id.kvs_key("R")).await {
                    Ok(Some(r)) => Some(r),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(id = %id, "could not read R: {e}");
                        None
                    }
                };
                let job = self.jobs.active_mut(id).expect("job looked up above");
                job.alloc_pending = false;
                job.resources = resources;
                let context = json!({ "note": note.unwrap_or_default() });
                if let Err(e) = self.post_event(id, "alloc", context, EventFlags::empty()) {
                    error!(id = %id, "alloc event failed: {e}");
                    return;
                }
                if let Some(annotations) = annotations {
                    if let Err(e) = self.annotations_update(id, &annotations) {
                        error!(id = %id, "alloc annotation update failed: {e}");
                    }
                }
                // A cancel raced the grant: the job moved to CLEANUP
                // before the allocation arrived. Treat it as transient
                // and hand the resources straight back.
                if let Some(job) = self.jobs.active_mut(id) {
                    if job.state == crate::job::JobState::Cleanup && job.has_resources {
                        job.free_pending = true;
                        let request = FreeRequest {
                            id,
                            resources: job.resources.clone().unwrap_or(Value::Null),
                            ranks: None,
                            is_final: true,
                        };
                        self.effects.push_back(Effect::SendFree(request));
                    }
                }
            }
            AllocResponse::Error { note, .. } => {
                if !job.alloc_pending {
                    error!(id = %id, "sched.alloc response: not requested");
                    self.scheduler_teardown("unsolicited alloc response");
                    return;
                }
                self.alloc.pending_count = self.alloc.pending_count.saturating_sub(1);
                let job = self.jobs.active_mut(id).expect("job looked up above");
                job.alloc_pending = false;
                if let Err(e) =
                    self.post_exception(id, "alloc", 0, None, note.as_deref().unwrap_or(""))
                {
                    error!(id = %id, "alloc exception failed: {e}");
                }
            }
        }
        self.drain_sched_queue().await;
        self.run_effects().await;
    }

    /// A `sched.free` response. Frees sent on behalf of housekeeping may
    /// arrive after the job retired; those acks are ignored.
    pub async fn handle_free_response(&mut self, id: JobId) {
        let Some(job) = self.jobs.active(id) else {
            return;
        };
        if !job.free_pending || !job.has_resources {
            error!(id = %id, "sched.free response: not pending");
            self.scheduler_teardown("unsolicited free response");
            return;
        }
        let job = self.jobs.active_mut(id).expect("job looked up above");
        job.free_pending = false;
        if let Err(e) = self.post_event(id, "free", json!({}), EventFlags::empty()) {
            error!(id = %id, "free event failed: {e}");
        }
        self.run_effects().await;
    }

    /// The host observed a transport-level error from the scheduler
    /// (a normal RPC error on alloc/free means it is unloading).
    pub fn handle_scheduler_error(&mut self, reason: &str) {
        self.scheduler_teardown(reason);
    }

    /// sched-expiration {id, expiration}: the scheduler adjusts a running
    /// job's expiration, e.g. when a resource lease changes.
    pub(crate) fn handle_sched_expiration(
        &mut self,
        request: &Request,
    ) -> Result<(), ServiceError> {
        let id = JobId(request.key_u64("id")?);
        let expiration = request
            .key("expiration")?
            .as_f64()
            .ok_or_else(|| ServiceError::proto("expiration is not a number"))?;
        let job = self
            .jobs
            .active(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        if job.state != crate::job::JobState::Run {
            return Err(ServiceError::StateConflict(format!(
                "expiration cannot change in {} state",
                job.state.name()
            )));
        }
        self.post_event(
            id,
            "resource-update",
            json!({ "expiration": expiration }),
            EventFlags::empty(),
        )?;
        request.responder.respond(json!({}));
        Ok(())
    }

    /// Stop feeding the scheduler and requeue everything in flight so it
    /// resends automatically after the next hello/ready handshake.
    pub(crate) fn scheduler_teardown(&mut self, reason: &str) {
        if !self.alloc.ready {
            return;
        }
        debug!("alloc: stop due to {reason}");
        let mut requeue = Vec::new();
        for job in self.jobs.iter_active_mut() {
            if job.alloc_pending {
                job.alloc_pending = false;
                job.alloc_queued = true;
                requeue.push(job.sched_key());
            }
            job.free_pending = false;
        }
        for key in requeue {
            self.alloc.insert(key);
        }
        self.alloc.pending_count = 0;
        self.alloc.ready = false;
        self.alloc.mode = SchedMode::default();
    }

    /// Queue a SCHED job for an alloc request unless one is already
    /// queued or outstanding.
    pub(crate) fn alloc_enqueue(&mut self, id: JobId) {
        let Some(job) = self.jobs.active_mut(id) else {
            return;
        };
        if job.alloc_queued || job.alloc_pending {
            return;
        }
        job.alloc_queued = true;
        let key = job.sched_key();
        self.alloc.insert(key);
    }

    pub(crate) fn alloc_dequeue(&mut self, id: JobId) {
        let Some(job) = self.jobs.active_mut(id) else {
            return;
        };
        if job.alloc_queued {
            job.alloc_queued = false;
            let key = job.sched_key();
            self.alloc.remove(&key);
        }
    }

    /// Cancel an outstanding alloc request. With `finalize`, local state
    /// is updated as though the scheduler had already acknowledged, so
    /// CLEANUP can progress without the round trip.
    pub(crate) fn alloc_cancel(&mut self, id: JobId, finalize: bool) {
        let Some(job) = self.jobs.active_mut(id) else {
            return;
        };
        if !job.alloc_pending {
            return;
        }
        self.effects.push_back(Effect::SchedCancel { id });
        if finalize {
            job.alloc_pending = false;
            self.alloc.pending_count = self.alloc.pending_count.saturating_sub(1);
        }
    }

    /// Remove a queued job by its pre-change key; used when a priority
    /// change dropped the job to held and its flags are already cleared.
    pub(crate) fn alloc_remove_key(&mut self, key: SchedKey) {
        self.alloc.remove(&key);
    }

    /// Re-key a queued job after a priority change.
    pub(crate) fn alloc_reorder(&mut self, id: JobId, old_priority: i64) {
        let Some(job) = self.jobs.active(id) else {
            return;
        };
        if !job.alloc_queued {
            return;
        }
        let old_key = SchedKey {
            priority: old_priority,
            id,
        };
        let new_key = job.sched_key();
        self.alloc.remove(&old_key);
        self.alloc.insert(new_key);
    }
}
