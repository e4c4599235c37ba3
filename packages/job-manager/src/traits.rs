//! Outbound interfaces to external collaborators.
//!
//! The scheduler, exec service, event bus, and housekeeping fanout are
//! reached through these traits; responses re-enter the core through
//! `JobManager::handle_*` methods, keyed by job id rather than any
//! transport-level matching. Send failures mean the peer is unreachable
//! and are handled by the caller's teardown path, never fatally.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::ids::JobId;

/// Payload of a `sched.alloc` request.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocRequest {
    pub id: JobId,
    pub priority: i64,
    pub userid: u32,
    pub t_submit: f64,
}

/// Payload of a `sched.free` request. `ranks` narrows the release to a
/// subset of execution targets during housekeeping partial release.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeRequest {
    pub id: JobId,
    pub resources: Value,
    pub ranks: Option<Vec<u32>>,
    pub is_final: bool,
}

/// One `sched.alloc` response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocResponse {
    /// type=0: resources granted; R was committed by the scheduler.
    Granted {
        id: JobId,
        note: Option<String>,
        annotations: Option<Value>,
    },
    /// type=1: annotation refresh; the request stays outstanding.
    Annotation { id: JobId, annotations: Value },
    /// type=2: the job cannot run.
    Error { id: JobId, note: Option<String> },
}

impl AllocResponse {
    pub fn id(&self) -> JobId {
        match self {
            AllocResponse::Granted { id, .. }
            | AllocResponse::Annotation { id, .. }
            | AllocResponse::Error { id, .. } => *id,
        }
    }
}

/// Result of a `sched.expiration` consult.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpirationResult {
    Accepted,
    /// The scheduler does not implement the method; treated as success.
    Unsupported,
    Rejected(String),
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn alloc(&self, req: AllocRequest) -> Result<()>;
    async fn free(&self, req: FreeRequest) -> Result<()>;
    /// No response expected.
    async fn cancel(&self, id: JobId) -> Result<()>;
    /// Bulk priority push; no response expected.
    async fn prioritize(&self, jobs: Vec<(JobId, i64)>) -> Result<()>;
    async fn expiration(&self, id: JobId, expiration: f64) -> Result<ExpirationResult>;
}

/// One frame of an exec start response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StartResponse {
    /// Shells are running.
    Start { id: JobId },
    /// Execution targets released; `is_final` ends the stream.
    Release {
        id: JobId,
        ranks: String,
        is_final: bool,
    },
    /// Wait status of the job's tasks.
    Finish { id: JobId, status: i64 },
    Exception {
        id: JobId,
        severity: i64,
        exc_type: String,
        note: String,
    },
}

impl StartResponse {
    pub fn id(&self) -> JobId {
        match self {
            StartResponse::Start { id }
            | StartResponse::Release { id, .. }
            | StartResponse::Finish { id, .. }
            | StartResponse::Exception { id, .. } => *id,
        }
    }
}

#[async_trait]
pub trait ExecClient: Send + Sync {
    /// Send `<service>.start {id, userid}`.
    async fn start(&self, service: &str, id: JobId, userid: u32) -> Result<()>;
}

/// Broadcast event publication (`job-exception`, `shell-<id>.kill`,
/// `job-state` batch notifications).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

/// Housekeeping script fanout across execution targets. Per-rank
/// completions and output re-enter through
/// `JobManager::handle_housekeeping_finish` / `handle_housekeeping_output`.
#[async_trait]
pub trait BulkExec: Send + Sync {
    async fn launch(
        &self,
        id: JobId,
        ranks: Vec<u32>,
        argv: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<()>;

    /// Signal every still-running target of `id`.
    async fn terminate(&self, id: JobId, signum: i32) -> Result<()>;
}

/// Feasibility service consulted for updates that require it.
#[async_trait]
pub trait FeasibilityClient: Send + Sync {
    async fn check(&self, jobspec: &Value) -> Result<(), String>;
}
