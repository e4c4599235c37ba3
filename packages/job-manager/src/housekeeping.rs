//! Post-job housekeeping.
//!
//! When a job in CLEANUP hands its resources over, housekeeping runs the
//! configured script on every execution target and returns resources to
//! the scheduler as targets complete, according to the release-after
//! policy. The job itself is free to reach INACTIVE immediately; the
//! scheduler keeps seeing the resources as allocated to the job id until
//! housekeeping releases them, including across a scheduler reload (the
//! hello reply re-advertises running allocations with their
//! already-released ranks).

use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, ReleaseAfter};
use crate::event::now_timestamp;
use crate::ids::JobId;
use crate::idset;
use crate::manager::{Effect, JobManager};
use crate::rpc::ServiceError;
use crate::traits::FreeRequest;

/// Completion status of the script on one execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Exited(i32),
    Signaled(i32),
}

impl TargetStatus {
    fn failed(&self) -> bool {
        !matches!(self, TargetStatus::Exited(0))
    }
}

/// Output stream tag for script output forwarded to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

pub struct Allocation {
    pub resources: Value,
    pub userid: u32,
    pub t_start: f64,
    /// Targets the script has not completed on yet.
    pub pending: BTreeSet<u32>,
    /// Completed targets not yet released to the scheduler.
    pub completed: BTreeSet<u32>,
    pub released: BTreeSet<u32>,
    failed: BTreeSet<u32>,
    deadline: Option<Instant>,
    timer_armed: bool,
    timer_expired: bool,
}

impl Allocation {
    fn allocated(&self) -> BTreeSet<u32> {
        let mut all = self.pending.clone();
        all.extend(&self.completed);
        all
    }
}

pub struct HousekeepingCtx {
    command: Option<Vec<String>>,
    release_after: ReleaseAfter,
    allocations: HashMap<JobId, Allocation>,
}

impl HousekeepingCtx {
    pub fn new() -> Self {
        Self {
            command: None,
            release_after: ReleaseAfter::Never,
            allocations: HashMap::new(),
        }
    }

    pub fn configure(&mut self, config: &Config) -> Result<(), ConfigError> {
        match &config.housekeeping {
            Some(hk) => {
                self.command = hk.resolved_command(config.imp_path.as_deref());
                self.release_after = hk.parsed_release_after()?;
            }
            None => {
                self.command = None;
                self.release_after = ReleaseAfter::Never;
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.command.is_some()
    }

    pub fn running_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.allocations.contains_key(&id)
    }

    pub(crate) fn remove(&mut self, id: JobId) -> Option<Allocation> {
        self.allocations.remove(&id)
    }

    /// Earliest partial-release deadline across running allocations.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.allocations
            .values()
            .filter_map(|a| a.deadline)
            .min()
    }

    /// Hello entries for allocations still running, plus the ids that
    /// must be terminated because the scheduler cannot accept a partial
    /// hello.
    pub(crate) fn hello_entries(&self, partial_ok: bool) -> (Vec<Value>, Vec<JobId>) {
        let mut entries = Vec::new();
        let mut doomed = Vec::new();
        for (&id, allocation) in &self.allocations {
            if !allocation.released.is_empty() && !partial_ok {
                doomed.push(id);
                continue;
            }
            let mut entry = json!({ "id": id.0 });
            if !allocation.released.is_empty() {
                entry["free"] = json!(idset::encode(&allocation.released));
            }
            entries.push(entry);
        }
        (entries, doomed)
    }

    pub fn stats(&self) -> Value {
        let mut running = serde_json::Map::new();
        for (id, allocation) in &self.allocations {
            running.insert(
                id.to_string(),
                json!({
                    "t_start": allocation.t_start,
                    "pending": idset::encode(&allocation.pending),
                    "allocated": idset::encode(&allocation.allocated()),
                }),
            );
        }
        json!({
            "running": running,
            "config": {
                "release-after": match self.release_after {
                    ReleaseAfter::Never => json!(null),
                    ReleaseAfter::Immediate => json!(0.0),
                    ReleaseAfter::After(d) => json!(d.as_secs_f64()),
                },
                "command": self.command.clone().map(Value::from).unwrap_or(Value::Null),
            },
        })
    }
}

impl Default for HousekeepingCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Execution target set from an R document (`execution.ranks` idset).
fn ranks_from_resources(resources: &Value) -> BTreeSet<u32> {
    resources
        .pointer("/execution/ranks")
        .and_then(Value::as_str)
        .and_then(|s| idset::decode(s).ok())
        .unwrap_or_default()
}

impl JobManager {
    /// Take over a CLEANUP job's resources and fan the script out across
    /// its execution targets. With no usable targets the resources go
    /// straight back to the scheduler.
    pub(crate) fn housekeeping_start(&mut self, id: JobId) -> Result<(), ServiceError> {
        let job = self
            .jobs
            .active(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        let resources = job.resources.clone().unwrap_or(Value::Null);
        let userid = job.userid;
        let ranks = ranks_from_resources(&resources);
        let Some(argv) = self.housekeeping.command.clone() else {
            return Err(ServiceError::Unavailable(
                "housekeeping is not configured".to_string(),
            ));
        };
        if ranks.is_empty() {
            self.effects.push_back(Effect::SendFree(FreeRequest {
                id,
                resources,
                ranks: None,
                is_final: true,
            }));
            return Ok(());
        }
        info!(id = %id, ranks = %idset::encode(&ranks), "housekeeping: start");
        let env = vec![
            ("FLUX_JOB_ID".to_string(), id.to_string()),
            ("FLUX_JOB_USERID".to_string(), userid.to_string()),
            ("FLUX_URI".to_string(), "local:///run/flux".to_string()),
        ];
        self.housekeeping.allocations.insert(
            id,
            Allocation {
                resources,
                userid,
                t_start: now_timestamp(),
                pending: ranks.clone(),
                completed: BTreeSet::new(),
                released: BTreeSet::new(),
                failed: BTreeSet::new(),
                deadline: None,
                timer_armed: false,
                timer_expired: false,
            },
        );
        self.effects.push_back(Effect::HousekeepingLaunch {
            id,
            ranks: ranks.into_iter().collect(),
            argv,
            env,
        });
        Ok(())
    }

    /// One execution target finished the script.
    pub async fn handle_housekeeping_finish(
        &mut self,
        id: JobId,
        rank: u32,
        status: TargetStatus,
    ) {
        let Some(allocation) = self.housekeeping.allocations.get_mut(&id) else {
            warn!(id = %id, rank, "housekeeping: finish for unknown allocation");
            return;
        };
        if !allocation.pending.remove(&rank) {
            warn!(id = %id, rank, "housekeeping: duplicate finish");
            return;
        }
        allocation.completed.insert(rank);
        if status.failed() {
            allocation.failed.insert(rank);
        }

        if allocation.pending.is_empty() {
            // Last target: the final release always carries final=true,
            // so this path never races the timer.
            let ranks: Vec<u32> = allocation.completed.iter().copied().collect();
            let resources = allocation.resources.clone();
            let failed = std::mem::take(&mut allocation.failed);
            self.housekeeping.allocations.remove(&id);
            if !failed.is_empty() {
                error!(id = %id, ranks = %idset::encode(&failed),
                    "housekeeping script failed on {} target(s)", failed.len());
            }
            info!(id = %id, "housekeeping: complete");
            self.effects.push_back(Effect::SendFree(FreeRequest {
                id,
                resources,
                ranks: Some(ranks),
                is_final: true,
            }));
        } else {
            let release_now = matches!(self.housekeeping.release_after, ReleaseAfter::Immediate)
                || allocation.timer_expired;
            if release_now {
                let ranks: Vec<u32> = allocation.completed.iter().copied().collect();
                allocation.released.extend(ranks.iter().copied());
                allocation.completed.clear();
                let resources = allocation.resources.clone();
                self.effects.push_back(Effect::SendFree(FreeRequest {
                    id,
                    resources,
                    ranks: Some(ranks),
                    is_final: false,
                }));
            } else if let ReleaseAfter::After(duration) = self.housekeeping.release_after {
                if !allocation.timer_armed {
                    allocation.deadline = Some(Instant::now() + duration);
                    allocation.timer_armed = true;
                }
            }
        }
        self.run_effects().await;
    }

    /// Script output forwarded to the operator log.
    pub fn handle_housekeeping_output(
        &self,
        id: JobId,
        rank: u32,
        stream: OutputStream,
        line: &str,
    ) {
        match stream {
            OutputStream::Stdout => info!(id = %id, rank, "housekeeping: {line}"),
            OutputStream::Stderr => error!(id = %id, rank, "housekeeping: {line}"),
        }
    }

    /// Earliest deadline the driver must wake for.
    pub fn housekeeping_next_deadline(&self) -> Option<Instant> {
        self.housekeeping.next_deadline()
    }

    /// Fire expired release-after timers: release what has completed so
    /// far and fall back to per-completion release for the rest.
    pub async fn handle_housekeeping_timer(&mut self) {
        let now = Instant::now();
        let due: Vec<JobId> = self
            .housekeeping
            .allocations
            .iter()
            .filter(|(_, a)| a.deadline.map(|d| d <= now).unwrap_or(false))
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            let Some(allocation) = self.housekeeping.allocations.get_mut(&id) else {
                continue;
            };
            allocation.deadline = None;
            allocation.timer_expired = true;
            if allocation.completed.is_empty() {
                continue;
            }
            let rank_set: BTreeSet<u32> = allocation.completed.iter().copied().collect();
            let ranks: Vec<u32> = rank_set.iter().copied().collect();
            allocation.released.extend(ranks.iter().copied());
            allocation.completed.clear();
            let resources = allocation.resources.clone();
            info!(id = %id, ranks = %idset::encode(&rank_set), "housekeeping: partial release");
            self.effects.push_back(Effect::SendFree(FreeRequest {
                id,
                resources,
                ranks: Some(ranks),
                is_final: false,
            }));
        }
        self.run_effects().await;
    }

    /// The launch itself failed: resources cannot be held hostage, so
    /// everything goes back to the scheduler immediately.
    pub(crate) fn housekeeping_abort(&mut self, id: JobId) {
        if let Some(allocation) = self.housekeeping.allocations.remove(&id) {
            let ranks: Vec<u32> = allocation.allocated().into_iter().collect();
            self.effects.push_back(Effect::SendFree(FreeRequest {
                id,
                resources: allocation.resources,
                ranks: Some(ranks),
                is_final: true,
            }));
        }
    }
}
