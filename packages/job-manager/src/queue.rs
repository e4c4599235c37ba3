//! Queue administration.
//!
//! An instance runs either one anonymous queue (the default) or a set of
//! named queues from config. `enable` gates submission, `start` gates
//! allocation. `checkpoint_start` is what persists across restarts and
//! may differ from `start` when an operator used the nocheckpoint toggle
//! for a temporary stop.

use serde_json::{json, Value};

use crate::config::Config;
use crate::rpc::ServiceError;

const ANON_DISABLE_HINT: &str = "job submission is disabled";

#[derive(Debug, Clone)]
pub struct Queue {
    pub name: Option<String>,
    pub enable: bool,
    pub disable_reason: Option<String>,
    pub start: bool,
    pub stop_reason: Option<String>,
    pub checkpoint_start: bool,
    pub requires: Vec<String>,
}

impl Queue {
    fn anonymous() -> Self {
        Self {
            name: None,
            enable: true,
            disable_reason: None,
            start: true,
            stop_reason: None,
            checkpoint_start: true,
            requires: Vec::new(),
        }
    }

    /// Named queues come up enabled but stopped until an operator or a
    /// checkpoint starts them.
    fn named(name: &str, requires: Vec<String>) -> Self {
        Self {
            name: Some(name.to_string()),
            enable: true,
            disable_reason: None,
            start: false,
            stop_reason: None,
            checkpoint_start: false,
            requires,
        }
    }

    fn set_enable(&mut self, enable: bool, reason: Option<&str>) {
        self.enable = enable;
        self.disable_reason = if enable { None } else { reason.map(str::to_string) };
    }

    fn set_start(&mut self, start: bool, reason: Option<&str>, nocheckpoint: bool) {
        self.start = start;
        self.stop_reason = if start { None } else { reason.map(str::to_string) };
        if !nocheckpoint {
            self.checkpoint_start = start;
        }
    }

    fn status(&self, sched_ready: bool) -> Value {
        let (start, stop_reason) = if !sched_ready {
            (false, Some("Scheduler is offline".to_string()))
        } else {
            (self.start, self.stop_reason.clone())
        };
        let mut o = json!({
            "enable": self.enable,
            "start": start,
        });
        if let Some(name) = &self.name {
            o["name"] = json!(name);
        }
        if let Some(reason) = &self.disable_reason {
            o["disable_reason"] = json!(reason);
        }
        if let Some(reason) = stop_reason {
            o["stop_reason"] = json!(reason);
        }
        o
    }

    fn checkpoint(&self) -> Value {
        let mut o = json!({
            "enable": self.enable,
            "start": self.checkpoint_start,
        });
        if let Some(name) = &self.name {
            o["name"] = json!(name);
        }
        if !self.enable {
            if let Some(reason) = &self.disable_reason {
                o["disable_reason"] = json!(reason);
            }
        }
        if !self.checkpoint_start {
            if let Some(reason) = &self.stop_reason {
                o["stop_reason"] = json!(reason);
            }
        }
        o
    }
}

pub struct QueueCtx {
    anon: Option<Queue>,
    named: Vec<Queue>,
    default_queue: Option<String>,
}

impl QueueCtx {
    pub fn new() -> Self {
        Self {
            anon: Some(Queue::anonymous()),
            named: Vec::new(),
            default_queue: None,
        }
    }

    /// (Re)apply configuration. Going between anonymous and named modes
    /// resets queue state; reconfiguring existing named queues keeps it.
    pub fn configure(&mut self, config: &Config) {
        self.default_queue = config.defaults.queue.clone();
        if config.queues.is_empty() {
            if self.anon.is_none() {
                self.anon = Some(Queue::anonymous());
                self.named.clear();
            }
            return;
        }
        self.anon = None;
        let mut queues = Vec::new();
        for (name, qconf) in &config.queues {
            match self.named.iter().find(|q| q.name.as_deref() == Some(name)) {
                Some(existing) => {
                    let mut q = existing.clone();
                    q.requires = qconf.requires.clone();
                    queues.push(q);
                }
                None => queues.push(Queue::named(name, qconf.requires.clone())),
            }
        }
        self.named = queues;
    }

    pub fn is_anonymous(&self) -> bool {
        self.anon.is_some()
    }

    /// Resolve the queue a submission lands in. Errors mirror the submit
    /// gate: unknown queue, missing queue name with named queues and no
    /// configured default, or a queue name with the anonymous queue.
    pub fn resolve<'a>(&'a self, name: Option<&str>) -> Result<&'a Queue, ServiceError> {
        match (&self.anon, name) {
            (Some(anon), None) => Ok(anon),
            (Some(_), Some(name)) => Err(ServiceError::Validation(format!(
                "queue '{name}' is not configured"
            ))),
            (None, requested) => {
                let name = requested
                    .map(str::to_string)
                    .or_else(|| self.default_queue.clone())
                    .ok_or_else(|| {
                        ServiceError::Validation(
                            "a queue must be specified for this instance".to_string(),
                        )
                    })?;
                self.named
                    .iter()
                    .find(|q| q.name.as_deref() == Some(name.as_str()))
                    .ok_or_else(|| {
                        ServiceError::Validation(format!("queue '{name}' is not configured"))
                    })
            }
        }
    }

    /// Submit gate: the queue must exist and be enabled. On success
    /// returns the resolved queue name (None for anonymous).
    pub fn submit_check(&self, name: Option<&str>) -> Result<Option<String>, ServiceError> {
        let queue = self.resolve(name)?;
        if !queue.enable {
            let reason = queue
                .disable_reason
                .clone()
                .unwrap_or_else(|| ANON_DISABLE_HINT.to_string());
            return Err(ServiceError::Validation(reason));
        }
        Ok(queue.name.clone())
    }

    pub fn requires(&self, name: Option<&str>) -> Vec<String> {
        self.resolve(name)
            .map(|q| q.requires.clone())
            .unwrap_or_default()
    }

    /// Whether the scheduler should be fed jobs from this queue.
    pub fn started(&self, name: Option<&str>) -> bool {
        self.resolve(name).map(|q| q.start).unwrap_or(false)
    }

    fn for_update<'a>(
        &'a mut self,
        name: Option<&str>,
        all: bool,
    ) -> Result<Vec<&'a mut Queue>, ServiceError> {
        match (&mut self.anon, name) {
            (Some(anon), None) => Ok(vec![anon]),
            (Some(_), Some(name)) => Err(ServiceError::Validation(format!(
                "queue '{name}' is not configured"
            ))),
            (None, Some(name)) => {
                let q = self
                    .named
                    .iter_mut()
                    .find(|q| q.name.as_deref() == Some(name))
                    .ok_or_else(|| {
                        ServiceError::Validation(format!("queue '{name}' is not configured"))
                    })?;
                Ok(vec![q])
            }
            (None, None) => {
                if !all {
                    return Err(ServiceError::Validation(
                        "Use 'all' to apply this command to all queues".to_string(),
                    ));
                }
                Ok(self.named.iter_mut().collect())
            }
        }
    }

    pub fn enable(
        &mut self,
        name: Option<&str>,
        all: bool,
        enable: bool,
        reason: Option<&str>,
    ) -> Result<(), ServiceError> {
        if !enable && reason.is_none() {
            return Err(ServiceError::proto("disable requires a reason"));
        }
        for queue in self.for_update(name, all)? {
            queue.set_enable(enable, reason);
        }
        Ok(())
    }

    pub fn start(
        &mut self,
        name: Option<&str>,
        all: bool,
        start: bool,
        reason: Option<&str>,
        nocheckpoint: bool,
    ) -> Result<(), ServiceError> {
        for queue in self.for_update(name, all)? {
            queue.set_start(start, reason, nocheckpoint);
        }
        Ok(())
    }

    pub fn list(&self) -> Value {
        match &self.anon {
            Some(_) => json!({ "queues": [] }),
            None => {
                let names: Vec<&str> = self
                    .named
                    .iter()
                    .filter_map(|q| q.name.as_deref())
                    .collect();
                json!({ "queues": names })
            }
        }
    }

    pub fn status(&self, name: Option<&str>, sched_ready: bool) -> Result<Value, ServiceError> {
        match name {
            Some(_) => Ok(self.resolve(name)?.status(sched_ready)),
            None => {
                let queues: Vec<Value> = self
                    .iter()
                    .map(|q| q.status(sched_ready))
                    .collect();
                Ok(json!({ "queues": queues }))
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Queue> {
        self.anon.iter().chain(self.named.iter())
    }

    /// Checkpoint payload, version 1.
    pub fn save(&self) -> Value {
        let entries: Vec<Value> = self.iter().map(Queue::checkpoint).collect();
        json!(entries)
    }

    /// Restore from a checkpoint of either supported version. Entries for
    /// queues that no longer exist are ignored.
    pub fn restore(&mut self, version: i64, entries: &Value) -> Result<(), ServiceError> {
        if version != 0 && version != 1 {
            return Err(ServiceError::proto(format!(
                "unknown queue checkpoint version {version}"
            )));
        }
        let entries = entries
            .as_array()
            .ok_or_else(|| ServiceError::proto("queue checkpoint is not an array"))?;
        for entry in entries {
            let name = entry.get("name").and_then(Value::as_str);
            let queue = match (&mut self.anon, name) {
                (Some(anon), None) => anon,
                (Some(_), Some(_)) | (None, None) => continue,
                (None, Some(name)) => {
                    match self
                        .named
                        .iter_mut()
                        .find(|q| q.name.as_deref() == Some(name))
                    {
                        Some(q) => q,
                        None => continue,
                    }
                }
            };
            let enable = entry
                .get("enable")
                .and_then(Value::as_bool)
                .ok_or_else(|| ServiceError::proto("queue checkpoint entry missing 'enable'"))?;
            if version == 0 {
                let reason = entry.get("reason").and_then(Value::as_str);
                queue.set_enable(enable, reason);
            } else {
                let disable_reason = entry.get("disable_reason").and_then(Value::as_str);
                queue.set_enable(enable, disable_reason);
                let start = entry
                    .get("start")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| ServiceError::proto("queue checkpoint entry missing 'start'"))?;
                let stop_reason = entry.get("stop_reason").and_then(Value::as_str);
                queue.set_start(start, stop_reason, false);
            }
        }
        Ok(())
    }
}

impl Default for QueueCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::manager::JobManager {
    pub(crate) fn handle_queue_list(
        &mut self,
        request: &crate::rpc::Request,
    ) -> Result<(), ServiceError> {
        request.responder.respond(self.queues.list());
        Ok(())
    }

    pub(crate) fn handle_queue_status(
        &mut self,
        request: &crate::rpc::Request,
    ) -> Result<(), ServiceError> {
        let name = request.opt_str("name")?.map(str::to_string);
        let status = self.queues.status(name.as_deref(), self.alloc.ready)?;
        request.responder.respond(status);
        Ok(())
    }

    pub(crate) fn handle_queue_enable(
        &mut self,
        request: &crate::rpc::Request,
    ) -> Result<(), ServiceError> {
        if !request.cred.owner {
            return Err(ServiceError::Authorization(
                "queue administration is limited to the instance owner".to_string(),
            ));
        }
        let name = request.opt_str("name")?.map(str::to_string);
        let all = request.opt_bool("all")?.unwrap_or(false);
        let enable = request.key_bool("enable")?;
        let reason = request.opt_str("reason")?.map(str::to_string);
        self.queues
            .enable(name.as_deref(), all, enable, reason.as_deref())?;
        request.responder.respond(json!({}));
        Ok(())
    }

    pub(crate) fn handle_queue_start(
        &mut self,
        request: &crate::rpc::Request,
    ) -> Result<(), ServiceError> {
        if !request.cred.owner {
            return Err(ServiceError::Authorization(
                "queue administration is limited to the instance owner".to_string(),
            ));
        }
        let name = request.opt_str("name")?.map(str::to_string);
        let all = request.opt_bool("all")?.unwrap_or(false);
        let start = request.key_bool("start")?;
        let reason = request.opt_str("reason")?.map(str::to_string);
        let nocheckpoint = request.opt_bool("nocheckpoint")?.unwrap_or(false);
        self.queues
            .start(name.as_deref(), all, start, reason.as_deref(), nocheckpoint)?;
        request.responder.respond(json!({}));
        // Starting a queue makes its SCHED jobs eligible; stopping one
        // does not recall requests already queued or sent.
        if start {
            for id in self.jobs.active_ids_ordered() {
                if let Err(e) = self.job_action(id) {
                    tracing::error!(id = %id, "queue start: action failed: {e}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_ctx() -> QueueCtx {
        let mut ctx = QueueCtx::new();
        let config = Config::from_value(json!({
            "queues": {
                "batch": {"requires": ["batch"]},
                "debug": {},
            }
        }))
        .unwrap();
        ctx.configure(&config);
        ctx
    }

    #[test]
    fn anonymous_queue_accepts_unnamed_submissions() {
        let ctx = QueueCtx::new();
        assert_eq!(ctx.submit_check(None).unwrap(), None);
        assert!(ctx.submit_check(Some("batch")).is_err());
    }

    #[test]
    fn named_mode_requires_a_queue_or_default() {
        let mut ctx = named_ctx();
        assert!(ctx.submit_check(None).is_err());
        assert_eq!(
            ctx.submit_check(Some("batch")).unwrap(),
            Some("batch".to_string())
        );

        let config = Config::from_value(json!({
            "queues": {"batch": {}},
            "defaults": {"queue": "batch"},
        }))
        .unwrap();
        ctx.configure(&config);
        assert_eq!(ctx.submit_check(None).unwrap(), Some("batch".to_string()));
    }

    #[test]
    fn disabled_queue_rejects_with_reason() {
        let mut ctx = named_ctx();
        ctx.enable(Some("batch"), false, false, Some("maintenance"))
            .unwrap();
        let err = ctx.submit_check(Some("batch")).unwrap_err();
        assert_eq!(err, ServiceError::Validation("maintenance".to_string()));
    }

    #[test]
    fn disable_requires_a_reason() {
        let mut ctx = named_ctx();
        assert!(ctx.enable(Some("batch"), false, false, None).is_err());
    }

    #[test]
    fn all_flag_required_for_unnamed_operation_on_named_queues() {
        let mut ctx = named_ctx();
        assert!(ctx.start(None, false, true, None, false).is_err());
        ctx.start(None, true, true, None, false).unwrap();
        assert!(ctx.started(Some("batch")));
        assert!(ctx.started(Some("debug")));
    }

    #[test]
    fn named_queues_default_to_stopped() {
        let ctx = named_ctx();
        assert!(!ctx.started(Some("batch")));
    }

    #[test]
    fn nocheckpoint_stop_does_not_persist() {
        let mut ctx = named_ctx();
        ctx.start(Some("batch"), false, true, None, false).unwrap();
        ctx.start(Some("batch"), false, false, Some("brief outage"), true)
            .unwrap();
        assert!(!ctx.started(Some("batch")));
        let saved = ctx.save();
        let entry = saved
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["name"] == json!("batch"))
            .unwrap();
        assert_eq!(entry["start"], json!(true));
    }

    #[test]
    fn save_restore_roundtrips_enable_and_start() {
        let mut ctx = named_ctx();
        ctx.enable(Some("batch"), false, false, Some("broken rack"))
            .unwrap();
        ctx.start(Some("debug"), false, true, None, false).unwrap();
        let saved = ctx.save();

        let mut restored = named_ctx();
        restored.restore(1, &saved).unwrap();
        assert!(restored.submit_check(Some("batch")).is_err());
        assert!(restored.started(Some("debug")));
        assert!(!restored.started(Some("batch")));
    }

    #[test]
    fn version0_checkpoint_restores_enable_only() {
        let mut ctx = named_ctx();
        ctx.restore(
            0,
            &json!([{"name": "batch", "enable": false, "reason": "old format"}]),
        )
        .unwrap();
        let err = ctx.submit_check(Some("batch")).unwrap_err();
        assert_eq!(err, ServiceError::Validation("old format".to_string()));
    }

    #[test]
    fn unknown_checkpoint_version_is_rejected() {
        let mut ctx = named_ctx();
        assert!(ctx.restore(7, &json!([])).is_err());
    }

    #[test]
    fn status_shows_scheduler_offline_as_stopped() {
        let mut ctx = named_ctx();
        ctx.start(Some("batch"), false, true, None, false).unwrap();
        let status = ctx.status(Some("batch"), false).unwrap();
        assert_eq!(status["start"], json!(false));
        assert_eq!(status["stop_reason"], json!("Scheduler is offline"));
        let status = ctx.status(Some("batch"), true).unwrap();
        assert_eq!(status["start"], json!(true));
    }

    #[test]
    fn reconfigure_preserves_existing_queue_state() {
        let mut ctx = named_ctx();
        ctx.start(Some("batch"), false, true, None, false).unwrap();
        let config = Config::from_value(json!({
            "queues": {
                "batch": {"requires": ["batch", "x86"]},
                "gpu": {},
            }
        }))
        .unwrap();
        ctx.configure(&config);
        assert!(ctx.started(Some("batch")));
        assert_eq!(
            ctx.requires(Some("batch")),
            vec!["batch".to_string(), "x86".to_string()]
        );
        assert!(!ctx.started(Some("gpu")));
        assert!(ctx.submit_check(Some("debug")).is_err());
    }
}
