//! Test doubles and fixtures.
//!
//! Recording implementations of the collaborator traits plus a harness
//! that wires a [`JobManager`] to them and drives the batch lifecycle
//! the way the host reactor would. Used by the colocated unit tests and
//! the end-to-end scenarios under `tests/`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Config;
use crate::ids::JobId;
use crate::kvs::{Kvs, MemoryKvs};
use crate::manager::{JobManager, Services};
use crate::rpc::{ClientId, Credentials, Request, Responder, Response};
use crate::traits::{
    AllocRequest, BulkExec, EventBus, ExecClient, ExpirationResult, FeasibilityClient,
    FreeRequest, SchedulerClient,
};

fn take<T>(items: &Mutex<Vec<T>>) -> Vec<T> {
    std::mem::take(&mut items.lock().expect("test lock"))
}

/// Scheduler double that records outbound traffic and can be told to
/// fail sends (simulating an unloaded scheduler).
#[derive(Default)]
pub struct RecordingScheduler {
    pub allocs: Mutex<Vec<AllocRequest>>,
    pub frees: Mutex<Vec<FreeRequest>>,
    pub cancels: Mutex<Vec<JobId>>,
    pub prioritizes: Mutex<Vec<Vec<(JobId, i64)>>>,
    pub expirations: Mutex<Vec<(JobId, f64)>>,
    pub fail_sends: AtomicBool,
    pub expiration_result: Mutex<Option<ExpirationResult>>,
}

impl RecordingScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn take_allocs(&self) -> Vec<AllocRequest> {
        take(&self.allocs)
    }

    pub fn take_frees(&self) -> Vec<FreeRequest> {
        take(&self.frees)
    }

    pub fn take_cancels(&self) -> Vec<JobId> {
        take(&self.cancels)
    }

    pub fn take_prioritizes(&self) -> Vec<Vec<(JobId, i64)>> {
        take(&self.prioritizes)
    }

    fn check(&self) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(anyhow!("scheduler unloaded"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SchedulerClient for RecordingScheduler {
    async fn alloc(&self, req: AllocRequest) -> Result<()> {
        self.check()?;
        self.allocs.lock().expect("test lock").push(req);
        Ok(())
    }

    async fn free(&self, req: FreeRequest) -> Result<()> {
        self.check()?;
        self.frees.lock().expect("test lock").push(req);
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> Result<()> {
        self.cancels.lock().expect("test lock").push(id);
        Ok(())
    }

    async fn prioritize(&self, jobs: Vec<(JobId, i64)>) -> Result<()> {
        self.prioritizes.lock().expect("test lock").push(jobs);
        Ok(())
    }

    async fn expiration(&self, id: JobId, expiration: f64) -> Result<ExpirationResult> {
        self.expirations
            .lock()
            .expect("test lock")
            .push((id, expiration));
        Ok(self
            .expiration_result
            .lock()
            .expect("test lock")
            .clone()
            .unwrap_or(ExpirationResult::Accepted))
    }
}

#[derive(Default)]
pub struct RecordingExec {
    pub starts: Mutex<Vec<(String, JobId, u32)>>,
    pub fail_sends: AtomicBool,
}

impl RecordingExec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_starts(&self) -> Vec<(String, JobId, u32)> {
        take(&self.starts)
    }
}

#[async_trait]
impl ExecClient for RecordingExec {
    async fn start(&self, service: &str, id: JobId, userid: u32) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("exec unloaded"));
        }
        self.starts
            .lock()
            .expect("test lock")
            .push((service.to_string(), id, userid));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEventBus {
    pub published: Mutex<Vec<(String, Value)>>,
}

impl RecordingEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_published(&self) -> Vec<(String, Value)> {
        take(&self.published)
    }

    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .expect("test lock")
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.published
            .lock()
            .expect("test lock")
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBulkExec {
    pub launches: Mutex<Vec<(JobId, Vec<u32>, Vec<String>, Vec<(String, String)>)>>,
    pub terminates: Mutex<Vec<(JobId, i32)>>,
}

impl RecordingBulkExec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_launches(&self) -> Vec<(JobId, Vec<u32>, Vec<String>, Vec<(String, String)>)> {
        take(&self.launches)
    }

    pub fn take_terminates(&self) -> Vec<(JobId, i32)> {
        take(&self.terminates)
    }
}

#[async_trait]
impl BulkExec for RecordingBulkExec {
    async fn launch(
        &self,
        id: JobId,
        ranks: Vec<u32>,
        argv: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<()> {
        self.launches
            .lock()
            .expect("test lock")
            .push((id, ranks, argv, env));
        Ok(())
    }

    async fn terminate(&self, id: JobId, signum: i32) -> Result<()> {
        self.terminates
            .lock()
            .expect("test lock")
            .push((id, signum));
        Ok(())
    }
}

/// Feasibility double with a fixed verdict.
pub struct FixedFeasibility {
    pub reject_with: Option<String>,
}

impl FixedFeasibility {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self { reject_with: None })
    }

    pub fn rejecting(msg: &str) -> Arc<Self> {
        Arc::new(Self {
            reject_with: Some(msg.to_string()),
        })
    }
}

#[async_trait]
impl FeasibilityClient for FixedFeasibility {
    async fn check(&self, _jobspec: &Value) -> Result<(), String> {
        match &self.reject_with {
            Some(msg) => Err(msg.clone()),
            None => Ok(()),
        }
    }
}

/// A job manager wired to recording doubles, with helpers that drive
/// the request/batch cycle the way the host reactor would.
pub struct TestHarness {
    pub jm: JobManager,
    pub kvs: Arc<MemoryKvs>,
    pub sched: Arc<RecordingScheduler>,
    pub exec: Arc<RecordingExec>,
    pub bus: Arc<RecordingEventBus>,
    pub bulk: Arc<RecordingBulkExec>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_store_and_config(MemoryKvs::new(), config)
    }

    /// Build over an existing store, as a restarted instance would.
    pub fn with_store(kvs: Arc<MemoryKvs>) -> Self {
        Self::with_store_and_config(kvs, Config::default())
    }

    pub fn with_store_and_config(kvs: Arc<MemoryKvs>, config: Config) -> Self {
        let sched = RecordingScheduler::new();
        let exec = RecordingExec::new();
        let bus = RecordingEventBus::new();
        let bulk = RecordingBulkExec::new();
        let jm = JobManager::new(
            config,
            Services {
                kvs: kvs.clone(),
                scheduler: sched.clone(),
                exec: exec.clone(),
                bus: bus.clone(),
                bulk_exec: bulk.clone(),
                feasibility: Some(FixedFeasibility::accepting()),
            },
        )
        .expect("job manager construction");
        Self {
            jm,
            kvs,
            sched,
            exec,
            bus,
            bulk,
        }
    }

    pub fn request(
        &self,
        topic: &str,
        payload: Value,
        cred: Credentials,
    ) -> (Request, UnboundedReceiver<Response>) {
        let (responder, rx) = Responder::new(ClientId::new());
        (
            Request {
                topic: topic.to_string(),
                payload,
                cred,
                responder,
            },
            rx,
        )
    }

    /// Dispatch one request as the owner and return its response stream.
    pub async fn rpc(&mut self, topic: &str, payload: Value) -> UnboundedReceiver<Response> {
        self.rpc_as(topic, payload, Credentials::owner(0)).await
    }

    pub async fn rpc_as(
        &mut self,
        topic: &str,
        payload: Value,
        cred: Credentials,
    ) -> UnboundedReceiver<Response> {
        let (request, rx) = self.request(topic, payload, cred);
        self.jm.dispatch(request).await;
        rx
    }

    /// Flush and commit open batches until the core settles, running
    /// effects and the scheduler drain in between, exactly like the
    /// driver loop.
    pub async fn settle(&mut self) {
        for _ in 0..16 {
            let Some(batch) = self.jm.flush_batch() else {
                break;
            };
            let result = self.kvs.commit(batch.txn.clone()).await;
            let ok = result.is_ok();
            self.jm.complete_batch(batch, ok).await;
            self.jm.drain_sched_queue().await;
            self.jm.run_effects().await;
        }
    }

    /// Submit one job and settle; panics unless the submission succeeds.
    pub async fn submit_job(&mut self, entry: Value) -> JobId {
        let mut rx = self.rpc("job-manager.submit", json!({ "jobs": [entry] })).await;
        self.settle().await;
        match rx.try_recv().expect("submit response after settle") {
            Response::Payload(payload) => {
                let errors = payload["errors"].as_array().expect("errors array");
                assert!(errors.is_empty(), "submit failed: {errors:?}");
                JobId(payload["ids"][0].as_u64().expect("job id"))
            }
            Response::Error { errstr, .. } => panic!("submit failed: {errstr}"),
        }
    }

    /// Default submit entry used by most scenarios.
    pub fn basic_job(&self) -> Value {
        json!({ "jobspec": {}, "urgency": 16, "userid": 42, "t_submit": 1.0 })
    }

    /// Bring the scheduler interface up in the given mode.
    pub async fn scheduler_ready(&mut self, mode: &str) {
        let mut hello = self.rpc("job-manager.sched-hello", json!({})).await;
        assert!(matches!(
            hello.try_recv().expect("hello response"),
            Response::Payload(_)
        ));
        let payload = if mode == "limited" {
            json!({ "mode": mode, "limit": 2 })
        } else {
            json!({ "mode": mode })
        };
        let mut ready = self.rpc("job-manager.sched-ready", payload).await;
        assert!(matches!(
            ready.try_recv().expect("ready response"),
            Response::Payload(_)
        ));
    }

    /// Register an exec service.
    pub async fn exec_ready(&mut self, service: &str) {
        let mut rx = self
            .rpc("job-manager.exec-hello", json!({ "service": service }))
            .await;
        assert!(matches!(
            rx.try_recv().expect("exec hello response"),
            Response::Payload(_)
        ));
    }

    /// Event names currently in a job's in-memory eventlog.
    pub fn event_names(&self, id: JobId) -> Vec<String> {
        self.jm
            .job_eventlog(id)
            .map(|entries| entries.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
