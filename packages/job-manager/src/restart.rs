//! Restart from persistent state.
//!
//! The job namespace is traversed at exactly the dothex depth, each
//! eventlog is replayed through the same state machine that produced it,
//! and the reconstructed jobs are reinserted as though they had never
//! left. Jobs that were waiting on the scheduler are forced back through
//! the PRIORITY pathway with a `flux-restart` event; running jobs are
//! marked for reattach and picked up when the exec service says hello.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::event::{self, EventEntry, EventFlags};
use crate::ids::{IdGenerator, JobId};
use crate::job::{Job, JobState, PRIORITY_UNSET};
use crate::kvs::KvsTxn;
use crate::manager::JobManager;

pub const CHECKPOINT_KEY: &str = "checkpoint.job-manager";

#[derive(Debug, Default, PartialEq)]
pub struct RestartSummary {
    pub active: usize,
    pub inactive: usize,
    pub rejected: usize,
    pub running: usize,
}

/// Rebuild one job from its persisted eventlog. The log must begin with
/// a submit event; every entry must be accepted by the state machine.
pub fn job_from_eventlog(id: JobId, log: &str, jobspec: Value) -> Result<Job> {
    let entries = EventEntry::decode_log(log).context("eventlog does not parse")?;
    let first = entries.first().ok_or_else(|| anyhow!("eventlog is empty"))?;
    if first.name != "submit" {
        return Err(anyhow!("eventlog does not begin with submit"));
    }
    let mut job = Job::new(id, 0);
    job.jobspec = jobspec;
    job.queue = job
        .jobspec
        .pointer("/attributes/system/queue")
        .and_then(Value::as_str)
        .map(str::to_string);
    for entry in &entries {
        event::apply(&mut job, entry)
            .map_err(|e| anyhow!("replay of '{}' failed: {e}", entry.name))?;
        job.eventlog.push(entry.clone());
        job.eventlog_seq += 1;
    }
    Ok(job)
}

impl JobManager {
    /// Load all jobs and checkpointed state from the KVS.
    pub async fn restart(&mut self, shard: u16) -> Result<RestartSummary> {
        let mut summary = RestartSummary::default();
        let dirs = self.traverse_job_dirs().await?;
        for dir in dirs {
            let Some(id) = JobId::from_kvs_dir(&dir) else {
                warn!(dir = %dir, "restart: ignoring malformed job directory");
                continue;
            };
            match self.restore_job(id, &dir).await {
                Ok(state) => {
                    if state.is_active() {
                        summary.active += 1;
                        if matches!(state, JobState::Run | JobState::Cleanup) {
                            summary.running += 1;
                        }
                    } else {
                        summary.inactive += 1;
                    }
                }
                Err(e) => {
                    error!(id = %id, "restart: cannot restore job: {e:#}");
                    summary.rejected += 1;
                }
            }
        }

        self.restore_checkpoint(shard).await?;

        // Interned event ids and queue membership for everything loaded.
        for id in self.jobs.active_ids_ordered() {
            let names: Vec<String> = self
                .jobs
                .active(id)
                .map(|job| job.eventlog.iter().map(|e| e.name.clone()).collect())
                .unwrap_or_default();
            for name in names {
                let index = self.event.event_index(&name);
                if let Some(job) = self.jobs.active_mut(id) {
                    job.event_id_set(index);
                }
            }
        }

        // First-sight plugin callbacks, in submission order.
        for id in self.jobs.active_ids_ordered() {
            let create = {
                let job = self.jobs.active(id).expect("job restored above");
                self.jobtap.call_create(job)
            };
            match create {
                Ok(actions) => self.apply_stack_actions(id, actions),
                Err(e) => error!(id = %id, plugin = %e.plugin, "restart job.create: {}", e.errmsg),
            }
            let new = {
                let job = self.jobs.active(id).expect("job restored above");
                self.jobtap.call_new(job)
            };
            match new {
                Ok(actions) => self.apply_stack_actions(id, actions),
                Err(e) => error!(id = %id, plugin = %e.plugin, "restart job.new: {}", e.errmsg),
            }
        }

        // Per-state recovery.
        for id in self.jobs.active_ids_ordered() {
            let Some(job) = self.jobs.active(id) else {
                continue;
            };
            match job.state {
                JobState::Depend => {
                    self.recheck_dependencies(id, true);
                    if let Err(e) = self.job_action(id) {
                        error!(id = %id, "restart: depend action failed: {e}");
                    }
                }
                JobState::Priority => {
                    if let Err(e) = self.job_action(id) {
                        error!(id = %id, "restart: priority action failed: {e}");
                    }
                }
                JobState::Sched => {
                    // Force a fresh priority event through the PRIORITY
                    // pathway; plugin policy may have changed across the
                    // restart.
                    if let Some(job) = self.jobs.active_mut(id) {
                        job.priority = PRIORITY_UNSET;
                    }
                    if let Err(e) =
                        self.post_event(id, "flux-restart", json!({}), EventFlags::empty())
                    {
                        error!(id = %id, "restart: flux-restart failed: {e}");
                    }
                }
                JobState::Run | JobState::Cleanup => {
                    if let Some(job) = self.jobs.active_mut(id) {
                        job.reattach = true;
                    }
                }
                _ => {}
            }
        }

        info!(
            active = summary.active,
            inactive = summary.inactive,
            rejected = summary.rejected,
            max_jobid = %self.max_jobid(),
            "restart complete"
        );
        Ok(summary)
    }

    async fn traverse_job_dirs(&self) -> Result<Vec<String>> {
        // The layout is exactly four 16-bit hex segments deep.
        let mut dirs = vec!["job".to_string()];
        for _ in 0..4 {
            let mut next = Vec::new();
            for dir in &dirs {
                for child in self.kvs.lookup_dir(dir).await? {
                    next.push(format!("{dir}.{child}"));
                }
            }
            dirs = next;
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn restore_job(&mut self, id: JobId, dir: &str) -> Result<JobState> {
        let log = self
            .kvs
            .get_raw(&format!("{dir}.eventlog"))
            .await?
            .ok_or_else(|| anyhow!("missing eventlog"))?;
        let jobspec = self
            .kvs
            .get(&format!("{dir}.jobspec"))
            .await?
            .unwrap_or(Value::Null);
        let mut job = job_from_eventlog(id, &log, jobspec)?;
        if job.has_resources || matches!(job.state, JobState::Run | JobState::Cleanup) {
            job.resources = self.kvs.get(&format!("{dir}.R")).await?;
        }
        let state = job.state;
        let waitable = job.is_waitable();
        if state.is_active() {
            self.jobs.insert_active(job);
        } else {
            self.jobs.insert_active(job);
            self.jobs.retire(id);
            if waitable {
                self.wait_notify_inactive(id);
            }
        }
        Ok(state)
    }

    async fn restore_checkpoint(&mut self, shard: u16) -> Result<()> {
        let checkpoint = self.kvs.get(CHECKPOINT_KEY).await?;
        let mut max_jobid = JobId(0);
        if let Some(checkpoint) = checkpoint {
            if let Some(id) = checkpoint.get("max_jobid").and_then(Value::as_u64) {
                max_jobid = JobId(id);
            }
            if let Some(queues) = checkpoint.get("queues") {
                let version = checkpoint
                    .get("queues_version")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                if let Err(e) = self.queues.restore(version, queues) {
                    warn!("restart: queue checkpoint ignored: {e}");
                }
            }
        }
        // The highest id ever seen wins, checkpointed or replayed.
        for id in self.jobs.active_ids_ordered() {
            max_jobid = max_jobid.max(id);
        }
        for id in self.jobs.inactive_ids_ordered() {
            max_jobid = max_jobid.max(id);
        }
        self.max_jobid = max_jobid;
        self.idgen = IdGenerator::restore(shard, max_jobid);
        Ok(())
    }

    /// Persist checkpoint state. Called at shutdown after the final
    /// batch flush.
    pub async fn checkpoint_save(&self) -> Result<()> {
        let mut txn = KvsTxn::new();
        txn.put(
            CHECKPOINT_KEY,
            json!({
                "max_jobid": self.max_jobid.0,
                "queues_version": 1,
                "queues": self.queues.save(),
            }),
        );
        self.kvs.commit(txn).await
    }

    /// Orderly shutdown: flush the open batch, then checkpoint.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(batch) = self.flush_batch() {
            let result = self.kvs.commit(batch.txn.clone()).await;
            let ok = result.is_ok();
            self.complete_batch(batch, ok).await;
            result?;
        }
        self.checkpoint_save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_reconstructs_run_state() {
        let log = "\
1.000000 submit {\"userid\":42,\"urgency\":16,\"flags\":0}\n\
1.100000 validate\n\
1.200000 depend\n\
1.300000 priority {\"priority\":16}\n\
1.400000 alloc\n";
        let job = job_from_eventlog(JobId(1), log, Value::Null).unwrap();
        assert_eq!(job.state, JobState::Run);
        assert_eq!(job.userid, 42);
        assert!(job.has_resources);
        assert_eq!(job.eventlog_seq, 5);
    }

    #[test]
    fn replay_rejects_log_not_starting_with_submit() {
        let err = job_from_eventlog(JobId(1), "1.0 depend\n", Value::Null).unwrap_err();
        assert!(err.to_string().contains("submit"));
    }

    #[test]
    fn replay_rejects_empty_log() {
        assert!(job_from_eventlog(JobId(1), "", Value::Null).is_err());
    }

    #[test]
    fn replay_rejects_invalid_transition() {
        let log = "1.000000 submit {\"userid\":0,\"urgency\":16,\"flags\":0}\n2.000000 alloc\n";
        assert!(job_from_eventlog(JobId(1), log, Value::Null).is_err());
    }
}
