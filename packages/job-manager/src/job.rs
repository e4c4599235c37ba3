//! Per-job record and lifecycle bookkeeping.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventEntry;
use crate::ids::JobId;
use crate::rpc::Responder;

pub const URGENCY_MIN: i32 = 0;
pub const URGENCY_HOLD: i32 = 0;
pub const URGENCY_DEFAULT: i32 = 16;
pub const URGENCY_MAX: i32 = 31;
pub const URGENCY_EXPEDITE: i32 = 31;

pub const PRIORITY_MIN: i64 = 0;
pub const PRIORITY_MAX: i64 = 4_294_967_295;

/// The job has not been prioritized yet; it parks in PRIORITY state.
pub const PRIORITY_UNSET: i64 = -1;
/// Sentinel returned by a priority plugin that cannot produce a value yet.
pub const PRIORITY_UNAVAIL: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    #[default]
    New,
    Depend,
    Priority,
    Sched,
    Run,
    Cleanup,
    Inactive,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Depend => "DEPEND",
            JobState::Priority => "PRIORITY",
            JobState::Sched => "SCHED",
            JobState::Run => "RUN",
            JobState::Cleanup => "CLEANUP",
            JobState::Inactive => "INACTIVE",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, JobState::Inactive)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JobFlags: u32 {
        /// A wait request may retrieve final status after INACTIVE.
        const WAITABLE = 1;
        /// Post debug.* events for protocol milestones.
        const DEBUG = 2;
        /// Jobspec updates are refused for any principal.
        const IMMUTABLE = 4;
    }
}

impl JobFlags {
    pub fn parse_one(name: &str) -> Option<JobFlags> {
        match name {
            "waitable" => Some(JobFlags::WAITABLE),
            "debug" => Some(JobFlags::DEBUG),
            "immutable" => Some(JobFlags::IMMUTABLE),
            _ => None,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(JobFlags::WAITABLE) {
            out.push("waitable");
        }
        if self.contains(JobFlags::DEBUG) {
            out.push("debug");
        }
        if self.contains(JobFlags::IMMUTABLE) {
            out.push("immutable");
        }
        out
    }
}

/// Dependency multiset that remembers spent descriptions: a description
/// removed once may never be added again for the same job.
#[derive(Debug, Default, Clone)]
pub struct DependencySet {
    active: Vec<String>,
    spent: HashSet<String>,
}

impl DependencySet {
    pub fn add(&mut self, description: &str) -> Result<(), DependencyError> {
        if self.spent.contains(description) || self.active.iter().any(|d| d == description) {
            return Err(DependencyError::AlreadyUsed);
        }
        self.active.push(description.to_string());
        Ok(())
    }

    pub fn remove(&mut self, description: &str) -> Result<(), DependencyError> {
        match self.active.iter().position(|d| d == description) {
            Some(idx) => {
                self.active.remove(idx);
                self.spent.insert(description.to_string());
                Ok(())
            }
            None => Err(DependencyError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyError {
    AlreadyUsed,
    NotFound,
}

/// Opaque per-plugin attachment value.
pub type AuxValue = Box<dyn Any + Send + Sync>;

/// Ordering key for the scheduler-facing queue: priority descending, then
/// id ascending (earlier submissions first at equal priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedKey {
    pub priority: i64,
    pub id: JobId,
}

impl Ord for SchedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for SchedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An event that arrived while the job was paused on a batch commit.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub name: String,
    pub context: Value,
    pub no_commit: bool,
}

pub struct Job {
    pub id: JobId,
    pub userid: u32,
    pub urgency: i32,
    pub priority: i64,
    pub t_submit: f64,
    pub t_clean: f64,
    pub flags: JobFlags,
    pub state: JobState,
    pub queue: Option<String>,
    pub jobspec: Value,
    pub resources: Option<Value>,

    pub eventlog: Vec<EventEntry>,
    pub eventlog_seq: u64,
    /// The event that pushed the job into CLEANUP, kept verbatim for
    /// result classification.
    pub end_event: Option<EventEntry>,

    pub annotations: Option<Value>,
    pub dependencies: DependencySet,

    // Pending-operation flags, each mutually constrained with `state`.
    /// The validate event has been posted; dependency evaluation and the
    /// depend transition are gated on it.
    pub validated: bool,
    pub depend_posted: bool,
    pub alloc_queued: bool,
    pub alloc_pending: bool,
    pub free_pending: bool,
    pub start_pending: bool,
    pub has_resources: bool,
    pub reattach: bool,
    pub kill_requested: bool,
    pub perilog_active: u32,

    /// Plugins subscribed to every event on this job, by plugin name.
    pub subscribers: HashSet<String>,
    /// Bitset of globally assigned event-name ids posted to this job.
    events_seen: Vec<u64>,
    /// Per-plugin attachments, destroyed when the owning plugin unloads.
    aux: HashMap<String, HashMap<String, AuxValue>>,

    /// At most one pending wait request.
    pub waiter: Option<Responder>,

    /// Event processing paused until the current batch commits; arrivals
    /// queue here in FIFO order.
    pub paused: bool,
    pub queued_events: VecDeque<QueuedEvent>,
}

impl Job {
    pub fn new(id: JobId, userid: u32) -> Self {
        Self {
            id,
            userid,
            urgency: URGENCY_DEFAULT,
            priority: PRIORITY_UNSET,
            t_submit: 0.0,
            t_clean: 0.0,
            flags: JobFlags::empty(),
            state: JobState::New,
            queue: None,
            jobspec: Value::Null,
            resources: None,
            eventlog: Vec::new(),
            eventlog_seq: 0,
            end_event: None,
            annotations: None,
            dependencies: DependencySet::default(),
            validated: false,
            depend_posted: false,
            alloc_queued: false,
            alloc_pending: false,
            free_pending: false,
            start_pending: false,
            has_resources: false,
            reattach: false,
            kill_requested: false,
            perilog_active: 0,
            subscribers: HashSet::new(),
            events_seen: Vec::new(),
            aux: HashMap::new(),
            waiter: None,
            paused: false,
            queued_events: VecDeque::new(),
        }
    }

    pub fn sched_key(&self) -> SchedKey {
        SchedKey {
            priority: self.priority,
            id: self.id,
        }
    }

    pub fn is_waitable(&self) -> bool {
        self.flags.contains(JobFlags::WAITABLE)
    }

    pub fn is_immutable(&self) -> bool {
        self.flags.contains(JobFlags::IMMUTABLE)
    }

    /// Record that an event with global id `index` was posted.
    pub fn event_id_set(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.events_seen.len() {
            self.events_seen.resize(word + 1, 0);
        }
        self.events_seen[word] |= 1 << (index % 64);
    }

    pub fn event_id_test(&self, index: usize) -> bool {
        self.events_seen
            .get(index / 64)
            .map(|w| w & (1 << (index % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn aux_set(&mut self, plugin: &str, name: &str, value: AuxValue) {
        self.aux
            .entry(plugin.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn aux_get(&self, plugin: &str, name: &str) -> Option<&AuxValue> {
        self.aux.get(plugin)?.get(name)
    }

    pub fn aux_delete(&mut self, plugin: &str, name: &str) -> bool {
        match self.aux.get_mut(plugin) {
            Some(items) => items.remove(name).is_some(),
            None => false,
        }
    }

    /// Drop every attachment owned by `plugin`. Returns the number of
    /// abandoned items so the host can log what the unload destroyed.
    pub fn aux_unload_plugin(&mut self, plugin: &str) -> usize {
        self.aux.remove(plugin).map(|items| items.len()).unwrap_or(0)
    }

    pub fn aux_plugins(&self) -> impl Iterator<Item = &str> {
        self.aux.keys().map(String::as_str)
    }

    /// Derive the (success, errstr) wait result from the end event.
    pub fn wait_result(&self) -> (bool, Option<String>) {
        match &self.end_event {
            Some(entry) if entry.name == "exception" => {
                let exc_type = entry
                    .context
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let note = entry.context.get("note").and_then(Value::as_str);
                let mut errstr = format!("Fatal exception type={exc_type}");
                if let Some(note) = note {
                    if !note.is_empty() {
                        errstr.push(' ');
                        errstr.push_str(note);
                    }
                }
                (false, Some(errstr))
            }
            Some(entry) if entry.name == "finish" => {
                // Context carries a wait status: low bits are the signal,
                // the next byte the exit code.
                let status = entry
                    .context
                    .get("status")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if status == 0 {
                    (true, None)
                } else if status & 0x7f != 0 {
                    (
                        false,
                        Some(format!("task(s) terminated by signal {}", status & 0x7f)),
                    )
                } else {
                    (
                        false,
                        Some(format!("task(s) exited with exit code {}", status >> 8)),
                    )
                }
            }
            Some(entry) => (false, Some(format!("job ended by {} event", entry.name))),
            None => (true, None),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("userid", &self.userid)
            .field("state", &self.state)
            .field("urgency", &self.urgency)
            .field("priority", &self.priority)
            .field("eventlog_seq", &self.eventlog_seq)
            .finish_non_exhaustive()
    }
}
