//! The job manager context.
//!
//! One [`JobManager`] owns every piece of mutable state: the job tables,
//! the open event batch, the plugin stack, queues, the scheduler and exec
//! interface state, housekeeping allocations, and pending control
//! requests. All mutation happens through `&mut self` from a single
//! driver task; outbound RPCs are queued as [`Effect`]s and performed by
//! [`JobManager::run_effects`], which is the moral equivalent of the
//! prep/check pair bracketing the original reactor's poll step.
//!
//! Event posting is synchronous: state transitions are visible in memory
//! immediately, while anything externally observable rides on the batch
//! and appears only after the KVS commit resolves.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alloc::AllocCtx;
use crate::config::Config;
use crate::drain::DrainCtx;
use crate::event::{self, Batch, EventCtx, EventEntry, EventFlags};
use crate::housekeeping::HousekeepingCtx;
use crate::ids::{IdGenerator, JobId};
use crate::job::{JobState, PRIORITY_MIN, PRIORITY_UNSET};
use crate::jobtap::{JobtapHost, StackActions};
use crate::journal::JournalCtx;
use crate::kvs::Kvs;
use crate::queue::QueueCtx;
use crate::rpc::{ClientId, Request, ServiceError};
use crate::start::ExecCtx;
use crate::table::JobTable;
use crate::traits::{
    BulkExec, EventBus, ExecClient, FeasibilityClient, FreeRequest, SchedulerClient,
};
use crate::wait::WaitCtx;

pub const SIGTERM: i32 = 15;

/// Outbound work queued by synchronous state handling and performed by
/// [`JobManager::run_effects`].
#[derive(Debug)]
pub enum Effect {
    SendFree(FreeRequest),
    SendStart { id: JobId, userid: u32 },
    Publish { topic: String, payload: Value },
    SchedCancel { id: JobId },
    SchedPrioritize { jobs: Vec<(JobId, i64)> },
    HousekeepingLaunch {
        id: JobId,
        ranks: Vec<u32>,
        argv: Vec<String>,
        env: Vec<(String, String)>,
    },
    HousekeepingTerminate { id: JobId, signum: i32 },
}

/// External collaborators handed to the core at construction.
pub struct Services {
    pub kvs: Arc<dyn Kvs>,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub exec: Arc<dyn ExecClient>,
    pub bus: Arc<dyn EventBus>,
    pub bulk_exec: Arc<dyn BulkExec>,
    pub feasibility: Option<Arc<dyn FeasibilityClient>>,
}

pub struct JobManager {
    pub(crate) config: Config,
    pub(crate) jobs: JobTable,
    pub(crate) event: EventCtx,
    pub(crate) jobtap: JobtapHost,
    pub(crate) queues: QueueCtx,
    pub(crate) alloc: AllocCtx,
    pub(crate) housekeeping: HousekeepingCtx,
    pub(crate) exec: ExecCtx,
    pub(crate) journal: JournalCtx,
    pub(crate) waits: WaitCtx,
    pub(crate) drain: DrainCtx,

    pub(crate) idgen: IdGenerator,
    pub(crate) max_jobid: JobId,

    pub(crate) effects: VecDeque<Effect>,
    fatal: Option<String>,

    pub(crate) kvs: Arc<dyn Kvs>,
    pub(crate) sched: Arc<dyn SchedulerClient>,
    pub(crate) execd: Arc<dyn ExecClient>,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) bulk: Arc<dyn BulkExec>,
    pub(crate) feasibility: Option<Arc<dyn FeasibilityClient>>,
}

impl JobManager {
    pub fn new(config: Config, services: Services) -> anyhow::Result<Self> {
        let mut manager = Self {
            jobs: JobTable::new(),
            event: EventCtx::new(),
            jobtap: JobtapHost::new(),
            queues: QueueCtx::new(),
            alloc: AllocCtx::new(),
            housekeeping: HousekeepingCtx::new(),
            exec: ExecCtx::default(),
            journal: JournalCtx::new(),
            waits: WaitCtx::default(),
            drain: DrainCtx::default(),
            idgen: IdGenerator::new(0),
            max_jobid: JobId(0),
            effects: VecDeque::new(),
            fatal: None,
            kvs: services.kvs,
            sched: services.scheduler,
            execd: services.exec,
            bus: services.bus,
            bulk: services.bulk_exec,
            feasibility: services.feasibility,
            config: Config::default(),
        };
        for name in crate::jobtap::builtins::default_names() {
            manager
                .jobtap
                .load_builtin(name)
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        for name in &config.plugins {
            manager
                .jobtap
                .load_builtin(name)
                .map_err(|e| anyhow::anyhow!("cannot load plugin: {e}"))?;
        }
        manager
            .apply_config(config)
            .map_err(|e| anyhow::anyhow!("bad config: {e}"))?;
        Ok(manager)
    }

    /// Apply (or re-apply) policy configuration and fan `conf.update` out
    /// to the plugin stack.
    pub fn apply_config(&mut self, config: Config) -> Result<(), ServiceError> {
        self.queues.configure(&config);
        self.housekeeping
            .configure(&config)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        if let Err(e) = self.jobtap.call_conf_update(&config) {
            return Err(ServiceError::Validation(format!(
                "plugin '{}' rejected config: {}",
                e.plugin, e.errmsg
            )));
        }
        self.config = config;
        Ok(())
    }

    /// A fatal condition (KVS commit failure) that requires the host to
    /// shut the reactor down cleanly.
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub(crate) fn set_fatal(&mut self, msg: String) {
        error!("fatal: {msg}");
        self.fatal = Some(msg);
    }

    pub fn max_jobid(&self) -> JobId {
        self.max_jobid
    }

    /// Store handle for the driver's commit step.
    pub fn kvs_handle(&self) -> Arc<dyn Kvs> {
        self.kvs.clone()
    }

    // ------------------------------------------------------------------
    // Event posting
    // ------------------------------------------------------------------

    /// Post an event to a job: update the state machine, append to the
    /// in-memory eventlog, enqueue the KVS append into the current batch
    /// (unless NO_COMMIT), notify the journal and subscribed plugins, and
    /// take any state-dependent actions.
    pub(crate) fn post_event(
        &mut self,
        id: JobId,
        name: &str,
        context: Value,
        flags: EventFlags,
    ) -> Result<(), ServiceError> {
        let job = self
            .jobs
            .active_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        if job.paused {
            job.queued_events.push_back(crate::job::QueuedEvent {
                name: name.to_string(),
                context,
                no_commit: flags.contains(EventFlags::NO_COMMIT),
            });
            return Ok(());
        }
        let entry = EventEntry::new(name, context);
        self.post_entry(id, entry, flags)
    }

    pub(crate) fn post_entry(
        &mut self,
        id: JobId,
        entry: EventEntry,
        flags: EventFlags,
    ) -> Result<(), ServiceError> {
        let index = self.event.event_index(&entry.name);
        let job = self
            .jobs
            .active_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id} is not active")))?;
        let prev_state = job.state;

        event::apply(job, &entry).map_err(|e| ServiceError::StateConflict(e.to_string()))?;

        job.event_id_set(index);
        job.eventlog.push(entry.clone());
        job.eventlog_seq += 1;
        let seq = job.eventlog_seq;
        let new_state = job.state;
        let eventlog_key = id.kvs_key("eventlog");

        if !flags.contains(EventFlags::NO_COMMIT) {
            let batch = self.event.batch();
            batch.txn.append(eventlog_key, entry.encode());
            self.event.pause_job(id);
        }

        self.journal.publish(id, seq, &entry);

        // Subscribed plugins see every event.
        let actions = {
            let job = self.jobs.active(id).expect("job looked up above");
            self.jobtap.call_event(job, &entry)
        };
        self.apply_stack_actions(id, actions);

        if new_state != prev_state {
            self.event.defer_state_pub(id, new_state, entry.timestamp);
            let result = {
                let job = self.jobs.active(id).expect("job looked up above");
                self.jobtap.call_state(job, new_state)
            };
            match result {
                Ok(actions) => self.apply_stack_actions(id, actions),
                Err(e) => {
                    // State notification is not a veto point.
                    error!(id = %id, plugin = %e.plugin, "job.state callback failed: {}", e.errmsg);
                }
            }
        }

        self.job_action(id)
    }

    /// Apply side effects collected from plugin callbacks.
    pub(crate) fn apply_stack_actions(&mut self, id: JobId, actions: StackActions) {
        for (plugin, act) in actions {
            if let Some(job) = self.jobs.lookup_mut(id) {
                for (name, value) in act.set_aux {
                    job.aux_set(&plugin, &name, value);
                }
                for name in act.delete_aux {
                    job.aux_delete(&plugin, &name);
                }
                if act.subscribe {
                    job.subscribers.insert(plugin.clone());
                }
                if act.unsubscribe {
                    job.subscribers.remove(&plugin);
                }
            }
            for description in act.add_dependencies {
                if let Err(e) = self.post_event(
                    id,
                    "dependency-add",
                    json!({ "description": description }),
                    EventFlags::empty(),
                ) {
                    error!(id = %id, plugin = %plugin, "dependency-add failed: {e}");
                }
            }
            for description in act.remove_dependencies {
                if let Err(e) = self.post_event(
                    id,
                    "dependency-remove",
                    json!({ "description": description }),
                    EventFlags::empty(),
                ) {
                    error!(id = %id, plugin = %plugin, "dependency-remove failed: {e}");
                }
            }
            if !act.set_flags.is_empty() {
                if let Err(e) = self.post_event(
                    id,
                    "set-flags",
                    json!({ "flags": act.set_flags }),
                    EventFlags::empty(),
                ) {
                    error!(id = %id, plugin = %plugin, "set-flags failed: {e}");
                }
            }
            for raise in act.raise {
                if let Err(e) =
                    self.post_exception(id, &raise.exc_type, raise.severity, None, &raise.note)
                {
                    error!(id = %id, plugin = %plugin, "plugin exception failed: {e}");
                }
            }
            if let Some(annotations) = act.annotations {
                if let Err(e) = self.annotations_update(id, &annotations) {
                    error!(id = %id, plugin = %plugin, "annotation update failed: {e}");
                }
            }
            if act.reprioritize {
                self.reprioritize_all();
            }
        }
    }

    // ------------------------------------------------------------------
    // State-dependent actions
    // ------------------------------------------------------------------

    /// Take whatever action the job's current state requires. Idempotent:
    /// pending flags dedupe the outbound side effects.
    pub(crate) fn job_action(&mut self, id: JobId) -> Result<(), ServiceError> {
        let Some(job) = self.jobs.active(id) else {
            return Ok(());
        };
        match job.state {
            JobState::New => Ok(()),
            JobState::Depend => {
                if job.validated && job.dependencies.is_empty() && !job.depend_posted {
                    self.post_event(id, "depend", json!({}), EventFlags::empty())?;
                }
                Ok(())
            }
            JobState::Priority => self.priority_action(id),
            JobState::Sched => {
                let queue_name = job.queue.clone();
                // Held (priority at the floor) and not-yet-prioritized
                // jobs stay out of the scheduler queue.
                let held = job.priority <= PRIORITY_MIN || job.priority == PRIORITY_UNSET;
                if !job.alloc_queued
                    && !job.alloc_pending
                    && !held
                    && self.queues.started(queue_name.as_deref())
                {
                    self.alloc_enqueue(id);
                }
                Ok(())
            }
            JobState::Run => {
                if !job.start_pending {
                    if let Some(_service) = self.exec.service.clone() {
                        let userid = job.userid;
                        let debug = job.flags.contains(crate::job::JobFlags::DEBUG);
                        let job = self.jobs.active_mut(id).expect("job looked up above");
                        job.start_pending = true;
                        self.effects.push_back(Effect::SendStart { id, userid });
                        if debug {
                            self.post_event(
                                id,
                                "debug.start-request",
                                json!({}),
                                EventFlags::empty(),
                            )?;
                        }
                    }
                }
                Ok(())
            }
            JobState::Cleanup => self.cleanup_action(id),
            JobState::Inactive => self.finalize_inactive(id),
        }
    }

    fn cleanup_action(&mut self, id: JobId) -> Result<(), ServiceError> {
        // Undo any scheduling still in flight.
        if self
            .jobs
            .active(id)
            .map(|j| j.alloc_queued)
            .unwrap_or(false)
        {
            self.alloc_dequeue(id);
        }
        if self
            .jobs
            .active(id)
            .map(|j| j.alloc_pending)
            .unwrap_or(false)
        {
            self.alloc_cancel(id, true);
        }
        let Some(job) = self.jobs.active_mut(id) else {
            return Ok(());
        };
        // Shells are signaled only when CLEANUP was forced by a fatal
        // exception; a normal finish lets them exit on their own.
        let exception_abort = job
            .end_event
            .as_ref()
            .map(|entry| entry.name == "exception")
            .unwrap_or(false);
        if job.start_pending && exception_abort && !job.kill_requested {
            job.kill_requested = true;
            let topic = format!("shell-{id}.kill");
            self.effects.push_back(Effect::Publish {
                topic,
                payload: json!({ "signum": SIGTERM }),
            });
        }
        let job = self.jobs.active(id).expect("job looked up above");
        // Resources cannot return while shells are still running.
        if job.has_resources && !job.free_pending && !job.start_pending {
            if self.housekeeping.enabled() {
                self.housekeeping_start(id)?;
                // Resources belong to housekeeping now; the job may finish
                // its cleanup without waiting for the script fanout.
                self.post_event(id, "free", json!({}), EventFlags::empty())?;
            } else if self.alloc.ready {
                let request = FreeRequest {
                    id,
                    resources: job.resources.clone().unwrap_or(Value::Null),
                    ranks: None,
                    is_final: true,
                };
                let debug = job.flags.contains(crate::job::JobFlags::DEBUG);
                let job = self.jobs.active_mut(id).expect("job looked up above");
                job.free_pending = true;
                self.effects.push_back(Effect::SendFree(request));
                if debug {
                    self.post_event(id, "debug.free-request", json!({}), EventFlags::empty())?;
                }
            }
            // With no scheduler loaded the resources are simply held;
            // the next hello replays this action.
        }
        let Some(job) = self.jobs.active(id) else {
            return Ok(());
        };
        if job.state == JobState::Cleanup
            && !job.has_resources
            && !job.free_pending
            && !job.start_pending
            && !job.alloc_pending
            && job.perilog_active == 0
        {
            self.post_event(id, "clean", json!({}), EventFlags::empty())?;
        }
        Ok(())
    }

    /// The job reached its terminal state: move it to the inactive table,
    /// answer waiters, and re-check drain/idle completions.
    fn finalize_inactive(&mut self, id: JobId) -> Result<(), ServiceError> {
        let Some(job) = self.jobs.active(id) else {
            return Ok(());
        };
        debug_assert_eq!(job.state, JobState::Inactive);
        info!(id = %id, "job is inactive");
        self.jobs.retire(id);
        self.wait_notify_inactive(id);
        self.drain_check();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound effects
    // ------------------------------------------------------------------

    /// Perform queued outbound work. Send failures follow the teardown
    /// rules: scheduler errors requeue pending allocs and await a new
    /// hello; exec errors clear start_pending; publish failures are
    /// logged and dropped.
    pub async fn run_effects(&mut self) {
        self.drain_check();
        while let Some(effect) = self.effects.pop_front() {
            match effect {
                Effect::SendFree(request) => {
                    let id = request.id;
                    if let Err(e) = self.sched.free(request).await {
                        warn!(id = %id, "sched.free failed: {e}");
                        if let Some(job) = self.jobs.active_mut(id) {
                            job.free_pending = false;
                        }
                        self.scheduler_teardown("free request error");
                    }
                }
                Effect::SendStart { id, userid } => {
                    let Some(service) = self.exec.service.clone() else {
                        continue;
                    };
                    if let Err(e) = self.execd.start(&service, id, userid).await {
                        warn!(id = %id, "exec start failed: {e}");
                        self.exec_teardown();
                    }
                }
                Effect::Publish { topic, payload } => {
                    if let Err(e) = self.bus.publish(&topic, payload).await {
                        error!(topic = %topic, "event publication failed: {e}");
                    }
                }
                Effect::SchedCancel { id } => {
                    if let Err(e) = self.sched.cancel(id).await {
                        debug!(id = %id, "sched.cancel failed: {e}");
                    }
                }
                Effect::SchedPrioritize { jobs } => {
                    if let Err(e) = self.sched.prioritize(jobs).await {
                        debug!("sched.prioritize failed: {e}");
                    }
                }
                Effect::HousekeepingLaunch {
                    id,
                    ranks,
                    argv,
                    env,
                } => {
                    if let Err(e) = self.bulk.launch(id, ranks, argv, env).await {
                        error!(id = %id, "housekeeping launch failed: {e}");
                        self.housekeeping_abort(id);
                    }
                }
                Effect::HousekeepingTerminate { id, signum } => {
                    if let Err(e) = self.bulk.terminate(id, signum).await {
                        error!(id = %id, "housekeeping terminate failed: {e}");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Batch lifecycle
    // ------------------------------------------------------------------

    /// When the open batch must be flushed, if one is open.
    pub fn batch_deadline(&self) -> Option<Instant> {
        self.event.deadline()
    }

    /// Close the open batch for commit. Jobs with entries in the batch
    /// pause further event processing until [`Self::complete_batch`].
    pub fn flush_batch(&mut self) -> Option<Batch> {
        let batch = self.event.take_batch()?;
        for &id in &batch.paused_jobs {
            if let Some(job) = self.jobs.lookup_mut(id) {
                job.paused = true;
            }
        }
        Some(batch)
    }

    /// Finish a committed (or failed) batch: state publications first,
    /// then user callbacks, then deferred responses, then unpausing
    /// paused jobs and draining their queued events in order.
    pub async fn complete_batch(&mut self, mut batch: Batch, commit_ok: bool) {
        if !commit_ok {
            self.set_fatal("eventlog commit failed".to_string());
        }
        if commit_ok {
            if let Some(id) = batch.pending_max_jobid.take() {
                if id > self.max_jobid {
                    self.max_jobid = id;
                }
            }
            let mut transitions = Vec::new();
            for publication in batch.state_pubs.drain(..) {
                transitions.push(json!([
                    publication.id.0,
                    publication.state.name(),
                    publication.timestamp,
                ]));
            }
            if !transitions.is_empty() {
                if let Err(e) = self
                    .bus
                    .publish("job-state", json!({ "transitions": transitions }))
                    .await
                {
                    error!("job-state publication failed: {e}");
                }
            }
            for id in batch.annotation_pubs.drain(..) {
                let annotations = self
                    .jobs
                    .lookup(id)
                    .and_then(|job| job.annotations.clone())
                    .unwrap_or(Value::Null);
                if let Err(e) = self
                    .bus
                    .publish("job-annotations", json!({ "id": id.0, "annotations": annotations }))
                    .await
                {
                    error!(id = %id, "annotation publication failed: {e}");
                }
            }
        }
        batch.run_callbacks(commit_ok);
        batch.send_responses(commit_ok);
        for id in std::mem::take(&mut batch.paused_jobs) {
            if let Some(job) = self.jobs.lookup_mut(id) {
                job.paused = false;
            }
            loop {
                let Some(job) = self.jobs.active_mut(id) else {
                    break;
                };
                if job.paused {
                    break;
                }
                let Some(queued) = job.queued_events.pop_front() else {
                    break;
                };
                let flags = if queued.no_commit {
                    EventFlags::NO_COMMIT
                } else {
                    EventFlags::empty()
                };
                if let Err(e) = self.post_event(id, &queued.name, queued.context, flags) {
                    error!(id = %id, event = %queued.name, "queued event failed: {e}");
                }
            }
            // Queued events may have changed inputs to the priority
            // computation (urgency, plugin state) without the usual
            // recompute-on-post step.
            if let Err(e) = self.reprioritize_one(id) {
                error!(id = %id, "reprioritize after unpause failed: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Route one inbound request to its handler. Every request is
    /// answered exactly once (directly, via the batch, or when a watched
    /// condition fires).
    pub async fn dispatch(&mut self, request: Request) {
        let topic = request.topic.clone();
        let result = match topic.as_str() {
            "job-manager.submit" => self.handle_submit(&request),
            "job-manager.wait" => self.handle_wait(&request),
            "job-manager.raise" => self.handle_raise(&request),
            "job-manager.kill" => self.handle_kill(&request),
            "job-manager.killall" => self.handle_killall(&request),
            "job-manager.urgency" => self.handle_urgency(&request),
            "job-manager.update" => self.handle_update(&request).await,
            "job-manager.annotate" => self.handle_annotate(&request),
            "job-manager.drain" => self.handle_drain(&request),
            "job-manager.idle" => self.handle_idle(&request),
            "job-manager.purge" => self.handle_purge(&request),
            "job-manager.list" => self.handle_list(&request),
            "job-manager.getattr" => self.handle_getattr(&request).await,
            "job-manager.getinfo" => self.handle_getinfo(&request),
            "job-manager.stats-get" => self.handle_stats(&request),
            "job-manager.journal" => self.handle_journal(&request),
            "job-manager.jobtap" => self.handle_jobtap_admin(&request),
            "job-manager.queue-list" => self.handle_queue_list(&request),
            "job-manager.queue-status" => self.handle_queue_status(&request),
            "job-manager.queue-enable" => self.handle_queue_enable(&request),
            "job-manager.queue-start" => self.handle_queue_start(&request),
            "job-manager.sched-hello" => self.handle_sched_hello(&request),
            "job-manager.sched-ready" => self.handle_sched_ready(&request),
            "job-manager.sched-expiration" => self.handle_sched_expiration(&request),
            "job-manager.exec-hello" => self.handle_exec_hello(&request),
            other => self.dispatch_plugin_service(other, &request),
        };
        if let Err(err) = result {
            if matches!(err, ServiceError::Protocol(_)) {
                error!(topic = %topic, "protocol error: {err}");
            }
            request.responder.respond_error(&err);
        }
        self.drain_sched_queue().await;
        self.run_effects().await;
    }

    fn dispatch_plugin_service(
        &mut self,
        topic: &str,
        request: &Request,
    ) -> Result<(), ServiceError> {
        let rest = topic
            .strip_prefix("job-manager.")
            .ok_or_else(|| ServiceError::Unavailable(format!("unknown service '{topic}'")))?;
        let (plugin, method) = rest
            .rsplit_once('.')
            .ok_or_else(|| ServiceError::Unavailable(format!("unknown service '{topic}'")))?;
        match self
            .jobtap
            .service_call(plugin, method, &request.payload, &request.cred)
        {
            Some(Ok(payload)) => {
                request.responder.respond(payload);
                Ok(())
            }
            Some(Err(errmsg)) => Err(ServiceError::Validation(errmsg)),
            None => Err(ServiceError::Unavailable(format!(
                "unknown service '{topic}'"
            ))),
        }
    }

    /// A client went away: every service drops or answers its pending
    /// requests whose route matches.
    pub fn disconnect(&mut self, client: ClientId) {
        self.journal.disconnect(client);
        self.waits.disconnect(client);
        self.drain.disconnect(client);
        for job in self.jobs.iter_active_mut() {
            if job
                .waiter
                .as_ref()
                .map(|w| w.client() == client)
                .unwrap_or(false)
            {
                job.waiter = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    fn running_jobs(&self) -> usize {
        self.jobs
            .iter_active()
            .filter(|job| matches!(job.state, JobState::Run | JobState::Cleanup))
            .count()
    }

    fn handle_stats(&mut self, request: &Request) -> Result<(), ServiceError> {
        request.responder.respond(self.stats());
        Ok(())
    }

    pub fn stats(&self) -> Value {
        json!({
            "active_jobs": self.jobs.active_count(),
            "inactive_jobs": self.jobs.inactive_count(),
            "max_jobid": self.max_jobid.0,
            "running_jobs": self.running_jobs(),
            "journal": { "listeners": self.journal.listener_count() },
            "alloc": self.alloc.stats(),
            "housekeeping": self.housekeeping.stats(),
        })
    }

    fn handle_getinfo(&mut self, request: &Request) -> Result<(), ServiceError> {
        request
            .responder
            .respond(json!({ "max_jobid": self.max_jobid.0 }));
        Ok(())
    }

    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        self.jobs.lookup(id).map(|job| job.state)
    }

    pub fn job_eventlog(&self, id: JobId) -> Option<&[EventEntry]> {
        self.jobs.lookup(id).map(|job| job.eventlog.as_slice())
    }

    pub fn job_priority(&self, id: JobId) -> Option<i64> {
        self.jobs.lookup(id).map(|job| job.priority)
    }

    pub fn job_annotations(&self, id: JobId) -> Option<Value> {
        self.jobs.lookup(id).and_then(|job| job.annotations.clone())
    }

    pub fn job_is_reattach(&self, id: JobId) -> Option<bool> {
        self.jobs.lookup(id).map(|job| job.reattach)
    }

    pub fn active_count(&self) -> usize {
        self.jobs.active_count()
    }

    pub fn inactive_count(&self) -> usize {
        self.jobs.inactive_count()
    }

    pub fn sched_queue_ids(&self) -> Vec<JobId> {
        self.alloc.queued_ids()
    }

    pub fn active_ids(&self) -> Vec<JobId> {
        self.jobs.active_ids_ordered()
    }

    pub fn sched_ready(&self) -> bool {
        self.alloc.ready
    }

    /// (alloc_queued, alloc_pending) for invariant checks.
    pub fn job_sched_flags(&self, id: JobId) -> Option<(bool, bool)> {
        self.jobs
            .lookup(id)
            .map(|job| (job.alloc_queued, job.alloc_pending))
    }

    pub fn zombie_count(&self) -> usize {
        self.waits.zombie_count()
    }

    /// Count of jobs in states that hold the instance busy, used by the
    /// idle service.
    pub(crate) fn pending_jobs(&self) -> usize {
        self.jobs
            .iter_active()
            .filter(|job| {
                matches!(
                    job.state,
                    JobState::Depend | JobState::Priority | JobState::Sched
                )
            })
            .count()
    }
}
