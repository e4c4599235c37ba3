//! Priority computation and scheduler queue reordering.
//!
//! Urgency is the user hint; priority is the scheduler-visible ordering
//! key. The reserved urgencies override whatever a priority plugin says:
//! held jobs pin to the minimum (and leave the inqueue), expedited jobs
//! pin to the maximum. A `priority` event is posted only when the value
//! actually changes, except in PRIORITY state where it always posts to
//! drive the transition to SCHED.

use serde_json::json;
use tracing::{debug, error};

use crate::event::EventFlags;
use crate::ids::JobId;
use crate::job::{
    JobState, PRIORITY_MAX, PRIORITY_MIN, URGENCY_EXPEDITE, URGENCY_HOLD,
};
use crate::jobtap::PriorityResult;
use crate::manager::{Effect, JobManager};
use crate::rpc::ServiceError;

/// Outcome of a priority computation for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Computed {
    Value(i64),
    Unavailable,
}

impl JobManager {
    /// Compute the job's priority: reserved urgencies override the
    /// plugin stack; otherwise the stack decides (the default builtin
    /// maps urgency through unchanged).
    pub(crate) fn computed_priority(&mut self, id: JobId) -> Computed {
        let Some(job) = self.jobs.active(id) else {
            return Computed::Unavailable;
        };
        match job.urgency {
            URGENCY_HOLD => Computed::Value(PRIORITY_MIN),
            URGENCY_EXPEDITE => Computed::Value(PRIORITY_MAX),
            urgency => match self.jobtap.get_priority(job) {
                Some(PriorityResult::Value(priority)) => Computed::Value(priority),
                Some(PriorityResult::Unavailable) => Computed::Unavailable,
                None => Computed::Value(i64::from(urgency)),
            },
        }
    }

    /// PRIORITY-state entry action: post a priority event as soon as one
    /// is available; otherwise the job parks here.
    pub(crate) fn priority_action(&mut self, id: JobId) -> Result<(), ServiceError> {
        match self.computed_priority(id) {
            Computed::Unavailable => Ok(()),
            Computed::Value(priority) => self.post_event(
                id,
                "priority",
                json!({ "priority": priority }),
                EventFlags::empty(),
            ),
        }
    }

    /// Recompute one SCHED job's priority after an urgency change or a
    /// plugin request, pushing the change to the scheduler as needed.
    pub(crate) fn reprioritize_one(&mut self, id: JobId) -> Result<(), ServiceError> {
        let Some(job) = self.jobs.active(id) else {
            return Ok(());
        };
        match job.state {
            JobState::Priority => self.priority_action(id),
            JobState::Sched => {
                let old_priority = job.priority;
                let priority = match self.computed_priority(id) {
                    Computed::Unavailable => {
                        // In SCHED the job already has a priority; a
                        // plugin that now claims unavailability is
                        // misbehaving. Keep the current value.
                        error!(id = %id, "priority plugin returned unavailable in SCHED");
                        return Ok(());
                    }
                    Computed::Value(priority) => priority,
                };
                if priority == old_priority {
                    return Ok(());
                }
                self.post_event(
                    id,
                    "priority",
                    json!({ "priority": priority }),
                    EventFlags::empty(),
                )?;
                self.apply_priority_change(id, old_priority, priority, None);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Post-priority-event bookkeeping shared by the single and sweep
    /// paths: reorder the inqueue, and either cancel or re-advertise a
    /// pending alloc. When `bulk` is given, prioritize pushes accumulate
    /// there instead of going out one at a time.
    pub(crate) fn apply_priority_change(
        &mut self,
        id: JobId,
        old_priority: i64,
        priority: i64,
        bulk: Option<&mut Vec<(JobId, i64)>>,
    ) {
        let Some(job) = self.jobs.active_mut(id) else {
            return;
        };
        if job.alloc_queued {
            if priority <= PRIORITY_MIN {
                // Held: leave the scheduler queue entirely.
                job.alloc_queued = false;
                self.alloc_remove_key(crate::job::SchedKey {
                    priority: old_priority,
                    id,
                });
            } else {
                self.alloc_reorder(id, old_priority);
            }
        } else if job.alloc_pending {
            if priority <= PRIORITY_MIN {
                self.alloc_cancel(id, true);
            } else {
                match bulk {
                    Some(jobs) => jobs.push((id, priority)),
                    None => self
                        .effects
                        .push_back(Effect::SchedPrioritize {
                            jobs: vec![(id, priority)],
                        }),
                }
            }
        } else if priority > PRIORITY_MIN {
            // Previously held; try to queue it again.
            if let Err(e) = self.job_action(id) {
                error!(id = %id, "action after priority change failed: {e}");
            }
        }
    }

    /// Sweep every job in PRIORITY or SCHED, post changed priorities, and
    /// push one bulk `sched.prioritize` for the jobs with requests
    /// outstanding.
    pub(crate) fn reprioritize_all(&mut self) {
        let ids = self.jobs.active_ids_ordered();
        let mut bulk: Vec<(JobId, i64)> = Vec::new();
        for id in ids {
            let Some(job) = self.jobs.active(id) else {
                continue;
            };
            match job.state {
                JobState::Priority => {
                    if let Err(e) = self.priority_action(id) {
                        error!(id = %id, "reprioritize failed: {e}");
                    }
                }
                JobState::Sched => {
                    let old_priority = job.priority;
                    let priority = match self.computed_priority(id) {
                        Computed::Unavailable => continue,
                        Computed::Value(priority) => priority,
                    };
                    if priority == old_priority {
                        continue;
                    }
                    if let Err(e) = self.post_event(
                        id,
                        "priority",
                        json!({ "priority": priority }),
                        EventFlags::empty(),
                    ) {
                        error!(id = %id, "priority event failed: {e}");
                        continue;
                    }
                    self.apply_priority_change(id, old_priority, priority, Some(&mut bulk));
                }
                _ => {}
            }
        }
        if !bulk.is_empty() {
            debug!(count = bulk.len(), "bulk sched.prioritize push");
            self.effects.push_back(Effect::SchedPrioritize { jobs: bulk });
        }
    }

}
