//! Eventlog batching and durability.
//!
//! Events posted to jobs are visible in memory immediately, but everything
//! externally observable that depends on them (submit ACKs, state
//! publications, drain completions) is withheld until the entries are
//! committed to the KVS. Entries accumulate in a [`Batch`]; the batch
//! closes on a short timer or an explicit flush, commits as one KVS
//! transaction, and its deferred work runs on completion.
//!
//! A commit failure is fatal: the core has no best-effort mode.

mod entry;
mod state;

pub use entry::{now_timestamp, EntryError, EventEntry};
pub use state::{apply, StateError};

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::ids::JobId;
use crate::job::JobState;
use crate::kvs::KvsTxn;
use crate::rpc::{Responder, ServiceError};

pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(10);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        /// Post the event without persisting it to the KVS eventlog.
        const NO_COMMIT = 1;
    }
}

/// A state transition queued for publication after commit.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePublication {
    pub id: JobId,
    pub state: JobState,
    pub timestamp: f64,
}

/// Deferred work that runs when the owning batch's commit resolves. The
/// closure receives the commit outcome so failures can be surfaced.
pub type BatchCallback = Box<dyn FnOnce(bool) + Send>;

/// One open accumulation of eventlog appends plus the work tied to its
/// durability.
#[derive(Default)]
pub struct Batch {
    pub txn: KvsTxn,
    responses: Vec<(Responder, Value)>,
    error_responses: Vec<(Responder, ServiceError)>,
    pub state_pubs: Vec<StatePublication>,
    pub annotation_pubs: Vec<JobId>,
    pub paused_jobs: Vec<JobId>,
    /// Highest id submitted in this batch; becomes visible through
    /// getinfo only once the batch commits.
    pub pending_max_jobid: Option<JobId>,
    callbacks: Vec<BatchCallback>,
}

impl Batch {
    fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.txn.is_empty()
            && self.responses.is_empty()
            && self.error_responses.is_empty()
            && self.state_pubs.is_empty()
            && self.annotation_pubs.is_empty()
            && self.paused_jobs.is_empty()
            && self.callbacks.is_empty()
    }

    /// Send every deferred response. Called by the completion path after
    /// state publications.
    pub fn send_responses(&mut self, commit_ok: bool) {
        for (responder, payload) in self.responses.drain(..) {
            if commit_ok {
                responder.respond(payload);
            } else {
                responder.respond_error(&ServiceError::Unavailable(
                    "eventlog commit failed".to_string(),
                ));
            }
        }
        for (responder, err) in self.error_responses.drain(..) {
            responder.respond_error(&err);
        }
    }

    pub fn run_callbacks(&mut self, commit_ok: bool) {
        for callback in self.callbacks.drain(..) {
            callback(commit_ok);
        }
    }
}

/// Batch lifecycle state owned by the job manager.
pub struct EventCtx {
    batch: Option<Batch>,
    deadline: Option<Instant>,
    batch_timeout: Duration,
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl EventCtx {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_BATCH_TIMEOUT)
    }

    pub fn with_timeout(batch_timeout: Duration) -> Self {
        Self {
            batch: None,
            deadline: None,
            batch_timeout,
            names: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Globally unique index for an event name, assigned on first sight.
    pub fn event_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn event_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Current batch, opening one (and arming the deadline) if needed.
    pub fn batch(&mut self) -> &mut Batch {
        if self.batch.is_none() {
            self.batch = Some(Batch::new());
            self.deadline = Some(Instant::now() + self.batch_timeout);
        }
        self.batch.as_mut().expect("batch was just opened")
    }

    pub fn has_open_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// When the open batch must be committed, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Close and take the open batch for commit.
    pub fn take_batch(&mut self) -> Option<Batch> {
        self.deadline = None;
        self.batch.take()
    }

    pub fn defer_response(&mut self, responder: Responder, payload: Value) {
        self.batch().responses.push((responder, payload));
    }

    pub fn defer_error(&mut self, responder: Responder, err: ServiceError) {
        self.batch().error_responses.push((responder, err));
    }

    pub fn defer_state_pub(&mut self, id: JobId, state: JobState, timestamp: f64) {
        self.batch().state_pubs.push(StatePublication {
            id,
            state,
            timestamp,
        });
    }

    pub fn defer_annotation_pub(&mut self, id: JobId) {
        let batch = self.batch();
        if !batch.annotation_pubs.contains(&id) {
            batch.annotation_pubs.push(id);
        }
    }

    pub fn defer_callback(&mut self, callback: BatchCallback) {
        self.batch().callbacks.push(callback);
    }

    pub fn defer_max_jobid(&mut self, id: JobId) {
        let batch = self.batch();
        if batch.pending_max_jobid.map(|m| id > m).unwrap_or(true) {
            batch.pending_max_jobid = Some(id);
        }
    }

    /// Register a job with the current batch. When the batch closes for
    /// commit, the job's event handling pauses until completion so its
    /// eventlog appends stay strictly ordered across commits.
    pub fn pause_job(&mut self, id: JobId) {
        let batch = self.batch();
        if !batch.paused_jobs.contains(&id) {
            batch.paused_jobs.push(id);
        }
    }
}

impl Default for EventCtx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{ClientId, Response};
    use serde_json::json;

    #[test]
    fn event_index_is_stable_per_name() {
        let mut ctx = EventCtx::new();
        let submit = ctx.event_index("submit");
        let alloc = ctx.event_index("alloc");
        assert_ne!(submit, alloc);
        assert_eq!(ctx.event_index("submit"), submit);
        assert_eq!(ctx.event_name(alloc), Some("alloc"));
    }

    #[test]
    fn first_append_opens_batch_and_arms_deadline() {
        let mut ctx = EventCtx::new();
        assert!(ctx.deadline().is_none());
        ctx.batch().txn.append("k", "line\n");
        assert!(ctx.has_open_batch());
        assert!(ctx.deadline().is_some());
        let batch = ctx.take_batch().unwrap();
        assert_eq!(batch.txn.len(), 1);
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn deferred_responses_flush_on_success() {
        let mut ctx = EventCtx::new();
        let (responder, mut rx) = Responder::new(ClientId::new());
        ctx.defer_response(responder, json!({"id": 1}));
        let mut batch = ctx.take_batch().unwrap();
        batch.send_responses(true);
        assert_eq!(rx.try_recv().unwrap(), Response::Payload(json!({"id": 1})));
    }

    #[test]
    fn deferred_responses_turn_into_errors_on_commit_failure() {
        let mut ctx = EventCtx::new();
        let (responder, mut rx) = Responder::new(ClientId::new());
        ctx.defer_response(responder, json!({"id": 1}));
        let mut batch = ctx.take_batch().unwrap();
        batch.send_responses(false);
        assert!(matches!(rx.try_recv().unwrap(), Response::Error { .. }));
    }

    #[test]
    fn callbacks_run_with_commit_outcome() {
        let mut ctx = EventCtx::new();
        let (tx, rx) = std::sync::mpsc::channel();
        ctx.defer_callback(Box::new(move |ok| tx.send(ok).unwrap()));
        let mut batch = ctx.take_batch().unwrap();
        batch.run_callbacks(false);
        assert_eq!(rx.try_recv().unwrap(), false);
    }

    #[test]
    fn paused_jobs_deduplicate() {
        let mut ctx = EventCtx::new();
        ctx.pause_job(JobId(9));
        ctx.pause_job(JobId(9));
        let batch = ctx.take_batch().unwrap();
        assert_eq!(batch.paused_jobs, vec![JobId(9)]);
    }
}
