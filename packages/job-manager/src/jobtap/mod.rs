//! Policy plugin host.
//!
//! Plugins observe the job lifecycle and can veto submissions and updates,
//! compute priority, manage dependencies, and expose their own service
//! methods. Callbacks are typed: a plugin receives a read view of the job
//! and records requested side effects in an [`Actions`] out-arg which the
//! job manager applies after the stack call returns, keeping all mutation
//! on the owning context.
//!
//! Builtins are named with a leading dot and are always loadable. Loading
//! externally compiled plugins is the host process's concern; it registers
//! them here the same way builtins are.

pub mod builtins;

use serde_json::{Map, Value};
use tracing::error;

use crate::config::Config;
use crate::event::EventEntry;
use crate::ids::JobId;
use crate::job::{AuxValue, Job, JobState};
use crate::rpc::Credentials;

/// Result of a `job.priority.get` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    Value(i64),
    /// The plugin cannot produce a priority yet; the job parks in
    /// PRIORITY state (or keeps its current priority in SCHED).
    Unavailable,
}

/// Result of a `job.dependency.<scheme>` callback.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyOutcome {
    /// No plugin handles this scheme.
    Unhandled,
    Accepted,
    Rejected(String),
}

/// Per-key result of a `job.update.<key>` callback.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateAccept {
    /// Re-run `job.validate` on the merged jobspec before posting.
    pub needs_validation: bool,
    /// Consult the feasibility service before posting.
    pub require_feasibility: bool,
    /// Additional path updates applied atomically with the request.
    pub updates: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Unhandled,
    Rejected(String),
    Accepted(UpdateAccept),
}

/// Exception requested by a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct RaiseRequest {
    pub exc_type: String,
    pub severity: i64,
    pub note: String,
}

/// Side effects collected during a callback and applied by the job
/// manager afterwards.
#[derive(Default)]
pub struct Actions {
    pub set_aux: Vec<(String, AuxValue)>,
    pub delete_aux: Vec<String>,
    /// Descriptions to post as dependency-add events.
    pub add_dependencies: Vec<String>,
    /// Descriptions to post as dependency-remove events.
    pub remove_dependencies: Vec<String>,
    pub raise: Vec<RaiseRequest>,
    pub set_flags: Vec<String>,
    pub annotations: Option<Value>,
    /// Subscribe the calling plugin to all of this job's events.
    pub subscribe: bool,
    pub unsubscribe: bool,
    /// Request a full reprioritization sweep.
    pub reprioritize: bool,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.set_aux.is_empty()
            && self.delete_aux.is_empty()
            && self.add_dependencies.is_empty()
            && self.remove_dependencies.is_empty()
            && self.raise.is_empty()
            && self.set_flags.is_empty()
            && self.annotations.is_none()
            && !self.subscribe
            && !self.unsubscribe
            && !self.reprioritize
    }
}

/// A policy plugin. Every hook has a no-op default so plugins implement
/// only what they care about.
#[allow(unused_variables)]
pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// First sight of a job in this process (submit or restart replay).
    fn job_create(&mut self, job: &Job, actions: &mut Actions) -> Result<(), String> {
        Ok(())
    }

    /// The job is fully constructed and validated state is settled.
    fn job_new(&mut self, job: &Job, actions: &mut Actions) -> Result<(), String> {
        Ok(())
    }

    /// Unanimous-accept gate at submit and revalidation time.
    fn job_validate(&mut self, job: &Job, jobspec: &Value) -> Result<(), String> {
        Ok(())
    }

    /// The job is leaving the tables for good.
    fn job_destroy(&mut self, job: &Job) {}

    fn job_state(
        &mut self,
        job: &Job,
        state: JobState,
        actions: &mut Actions,
    ) -> Result<(), String> {
        Ok(())
    }

    /// Delivered only to plugins subscribed to this job.
    fn job_event(
        &mut self,
        job: &Job,
        entry: &EventEntry,
        actions: &mut Actions,
    ) -> Result<(), String> {
        Ok(())
    }

    fn priority_get(&mut self, job: &Job) -> Option<PriorityResult> {
        None
    }

    fn dependency(
        &mut self,
        job: &Job,
        scheme: &str,
        value: &Value,
        actions: &mut Actions,
    ) -> DependencyOutcome {
        DependencyOutcome::Unhandled
    }

    fn update(
        &mut self,
        job: &Job,
        key: &str,
        value: &Value,
        cred: &Credentials,
    ) -> UpdateOutcome {
        UpdateOutcome::Unhandled
    }

    fn conf_update(&mut self, config: &Config) -> Result<(), String> {
        Ok(())
    }

    /// `plugin.query` introspection payload.
    fn query(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Service method namespaced under the plugin name. `None` means the
    /// method does not exist.
    fn service(&mut self, method: &str, payload: &Value, cred: &Credentials) -> Option<Result<Value, String>> {
        None
    }
}

/// An error from a stack call: which plugin rejected, and its message.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginError {
    pub plugin: String,
    pub errmsg: String,
}

impl PluginError {
    fn new(plugin: &str, errmsg: String) -> Self {
        let errmsg = if errmsg.is_empty() {
            "rejected by plugin".to_string()
        } else {
            errmsg
        };
        Self {
            plugin: plugin.to_string(),
            errmsg,
        }
    }
}

struct Loaded {
    name: String,
    plugin: Box<dyn Plugin>,
}

/// Ordered plugin stack.
#[derive(Default)]
pub struct JobtapHost {
    stack: Vec<Loaded>,
}

/// Everything a stack call produced: per-plugin actions in call order.
pub type StackActions = Vec<(String, Actions)>;

impl JobtapHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin at the end of the stack. A plugin with the same
    /// name replaces the old one (the caller is responsible for destroying
    /// job aux owned by the replaced instance first).
    pub fn load(&mut self, plugin: Box<dyn Plugin>) -> String {
        let name = plugin.name().to_string();
        self.stack.retain(|loaded| loaded.name != name);
        self.stack.push(Loaded {
            name: name.clone(),
            plugin,
        });
        name
    }

    /// Instantiate a builtin by its dotted name.
    pub fn load_builtin(&mut self, name: &str) -> Result<String, String> {
        let plugin = builtins::create(name).ok_or_else(|| format!("unknown builtin '{name}'"))?;
        Ok(self.load(plugin))
    }

    pub fn unload(&mut self, name: &str) -> bool {
        let before = self.stack.len();
        self.stack.retain(|loaded| loaded.name != name);
        before != self.stack.len()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.stack.iter().any(|loaded| loaded.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.stack.iter().map(|loaded| loaded.name.clone()).collect()
    }

    /// `job.create` / `job.new` / `job.state.*` style call: every plugin in
    /// load order; the first error stops the stack.
    fn stack_call<F>(&mut self, mut call: F) -> Result<StackActions, PluginError>
    where
        F: FnMut(&mut dyn Plugin, &mut Actions) -> Result<(), String>,
    {
        let mut all = Vec::new();
        for loaded in self.stack.iter_mut() {
            let mut actions = Actions::default();
            match call(loaded.plugin.as_mut(), &mut actions) {
                Ok(()) => {
                    if !actions.is_empty() {
                        all.push((loaded.name.clone(), actions));
                    }
                }
                Err(errmsg) => return Err(PluginError::new(&loaded.name, errmsg)),
            }
        }
        Ok(all)
    }

    pub fn call_create(&mut self, job: &Job) -> Result<StackActions, PluginError> {
        self.stack_call(|plugin, actions| plugin.job_create(job, actions))
    }

    pub fn call_new(&mut self, job: &Job) -> Result<StackActions, PluginError> {
        self.stack_call(|plugin, actions| plugin.job_new(job, actions))
    }

    pub fn call_state(&mut self, job: &Job, state: JobState) -> Result<StackActions, PluginError> {
        self.stack_call(|plugin, actions| plugin.job_state(job, state, actions))
    }

    /// Unanimous accept; first rejection fails the submission or update.
    pub fn call_validate(&mut self, job: &Job, jobspec: &Value) -> Result<(), PluginError> {
        for loaded in self.stack.iter_mut() {
            if let Err(errmsg) = loaded.plugin.job_validate(job, jobspec) {
                return Err(PluginError::new(&loaded.name, errmsg));
            }
        }
        Ok(())
    }

    pub fn call_destroy(&mut self, job: &Job) {
        for loaded in self.stack.iter_mut() {
            loaded.plugin.job_destroy(job);
        }
    }

    /// Deliver an event to the plugins subscribed to this job.
    pub fn call_event(&mut self, job: &Job, entry: &EventEntry) -> StackActions {
        let mut all = Vec::new();
        for loaded in self.stack.iter_mut() {
            if !job.subscribers.contains(&loaded.name) {
                continue;
            }
            let mut actions = Actions::default();
            if let Err(errmsg) = loaded.plugin.job_event(job, entry, &mut actions) {
                // Event notification is not a veto point.
                error!(plugin = %loaded.name, id = %job.id, event = %entry.name,
                       "job.event callback failed: {errmsg}");
            }
            if !actions.is_empty() {
                all.push((loaded.name.clone(), actions));
            }
        }
        all
    }

    /// Last plugin with an opinion wins, so plugins loaded after
    /// `.priority-default` override it.
    pub fn get_priority(&mut self, job: &Job) -> Option<PriorityResult> {
        let mut result = None;
        for loaded in self.stack.iter_mut() {
            if let Some(r) = loaded.plugin.priority_get(job) {
                result = Some(r);
            }
        }
        result
    }

    /// Offer a dependency to the stack; the first plugin that handles the
    /// scheme decides.
    pub fn call_dependency(
        &mut self,
        job: &Job,
        scheme: &str,
        value: &Value,
    ) -> (DependencyOutcome, StackActions) {
        let mut all = Vec::new();
        for loaded in self.stack.iter_mut() {
            let mut actions = Actions::default();
            let outcome = loaded.plugin.dependency(job, scheme, value, &mut actions);
            if !actions.is_empty() {
                all.push((loaded.name.clone(), actions));
            }
            match outcome {
                DependencyOutcome::Unhandled => continue,
                other => return (other, all),
            }
        }
        (DependencyOutcome::Unhandled, all)
    }

    /// Offer an update key to the stack; the first plugin that handles the
    /// key decides.
    pub fn call_update(
        &mut self,
        job: &Job,
        key: &str,
        value: &Value,
        cred: &Credentials,
    ) -> UpdateOutcome {
        for loaded in self.stack.iter_mut() {
            match loaded.plugin.update(job, key, value, cred) {
                UpdateOutcome::Unhandled => continue,
                other => return other,
            }
        }
        UpdateOutcome::Unhandled
    }

    pub fn call_conf_update(&mut self, config: &Config) -> Result<(), PluginError> {
        for loaded in self.stack.iter_mut() {
            if let Err(errmsg) = loaded.plugin.conf_update(config) {
                return Err(PluginError::new(&loaded.name, errmsg));
            }
        }
        Ok(())
    }

    pub fn query(&self, name: &str) -> Option<Value> {
        self.stack
            .iter()
            .find(|loaded| loaded.name == name)
            .map(|loaded| loaded.plugin.query())
    }

    pub fn service_call(
        &mut self,
        plugin: &str,
        method: &str,
        payload: &Value,
        cred: &Credentials,
    ) -> Option<Result<Value, String>> {
        self.stack
            .iter_mut()
            .find(|loaded| loaded.name == plugin)?
            .plugin
            .service(method, payload, cred)
    }

    /// Call one named plugin's hook, collecting its actions. Used when a
    /// freshly loaded plugin is brought up to date on existing jobs.
    fn single_call<F>(&mut self, name: &str, mut call: F) -> Option<(Actions, Result<(), String>)>
    where
        F: FnMut(&mut dyn Plugin, &mut Actions) -> Result<(), String>,
    {
        let loaded = self.stack.iter_mut().find(|loaded| loaded.name == name)?;
        let mut actions = Actions::default();
        let result = call(loaded.plugin.as_mut(), &mut actions);
        Some((actions, result))
    }

    pub fn call_create_one(&mut self, name: &str, job: &Job) -> Option<(Actions, Result<(), String>)> {
        self.single_call(name, |plugin, actions| plugin.job_create(job, actions))
    }

    pub fn call_new_one(&mut self, name: &str, job: &Job) -> Option<(Actions, Result<(), String>)> {
        self.single_call(name, |plugin, actions| plugin.job_new(job, actions))
    }

    pub fn call_state_one(
        &mut self,
        name: &str,
        job: &Job,
        state: JobState,
    ) -> Option<(Actions, Result<(), String>)> {
        self.single_call(name, |plugin, actions| plugin.job_state(job, state, actions))
    }
}

impl crate::manager::JobManager {
    /// jobtap admin: load/remove/query/list plugins.
    pub(crate) fn handle_jobtap_admin(
        &mut self,
        request: &crate::rpc::Request,
    ) -> Result<(), crate::rpc::ServiceError> {
        use crate::rpc::ServiceError;
        if !request.cred.owner {
            return Err(ServiceError::Authorization(
                "plugin administration is limited to the instance owner".to_string(),
            ));
        }
        if let Some(name) = request.opt_str("load")? {
            let name = self
                .jobtap
                .load_builtin(name)
                .map_err(ServiceError::Validation)?;
            let config = self.config.clone();
            if let Err(e) = self.jobtap.call_conf_update(&config) {
                error!(plugin = %e.plugin, "conf update on load failed: {}", e.errmsg);
            }
            self.plugin_load_sync(&name);
            request
                .responder
                .respond(serde_json::json!({ "plugins": self.jobtap.names() }));
            return Ok(());
        }
        if let Some(name) = request.opt_str("remove")? {
            let name = name.to_string();
            self.plugin_unload(&name);
            if !self.jobtap.unload(&name) {
                return Err(ServiceError::NotFound(format!(
                    "plugin '{name}' is not loaded"
                )));
            }
            request
                .responder
                .respond(serde_json::json!({ "plugins": self.jobtap.names() }));
            return Ok(());
        }
        if let Some(name) = request.opt_str("query")? {
            let payload = self
                .jobtap
                .query(name)
                .ok_or_else(|| ServiceError::NotFound(format!("plugin '{name}' is not loaded")))?;
            request.responder.respond(payload);
            return Ok(());
        }
        request
            .responder
            .respond(serde_json::json!({ "plugins": self.jobtap.names() }));
        Ok(())
    }

    /// Register an externally built plugin and bring it up to date.
    pub fn load_plugin(&mut self, plugin: Box<dyn Plugin>) {
        let name = self.jobtap.load(plugin);
        if let Err(e) = self.jobtap.call_conf_update(&self.config.clone()) {
            tracing::error!(plugin = %e.plugin, "conf update on load failed: {}", e.errmsg);
        }
        self.plugin_load_sync(&name);
    }

    /// Synthesize first-sight callbacks for every active job into a
    /// newly loaded plugin: create, then new (in submission order), then
    /// state.depend plus dependency checks for jobs parked in DEPEND.
    /// A full reprioritization follows.
    pub(crate) fn plugin_load_sync(&mut self, name: &str) {
        for id in self.jobs.active_ids_ordered() {
            for call in ["create", "new"] {
                let result = {
                    let Some(job) = self.jobs.active(id) else {
                        continue;
                    };
                    match call {
                        "create" => self.jobtap.call_create_one(name, job),
                        _ => self.jobtap.call_new_one(name, job),
                    }
                };
                if let Some((actions, result)) = result {
                    if let Err(errmsg) = result {
                        tracing::error!(id = %id, plugin = %name,
                            "synthesized job.{call} failed: {errmsg}");
                    }
                    if !actions.is_empty() {
                        self.apply_stack_actions(id, vec![(name.to_string(), actions)]);
                    }
                }
            }
        }
        for id in self.jobs.active_ids_ordered() {
            let in_depend = self
                .jobs
                .active(id)
                .map(|job| job.state == JobState::Depend)
                .unwrap_or(false);
            if !in_depend {
                continue;
            }
            let result = {
                let job = self.jobs.active(id).expect("checked above");
                self.jobtap.call_state_one(name, job, JobState::Depend)
            };
            if let Some((actions, result)) = result {
                if let Err(errmsg) = result {
                    tracing::error!(id = %id, plugin = %name,
                        "synthesized job.state.depend failed: {errmsg}");
                }
                if !actions.is_empty() {
                    self.apply_stack_actions(id, vec![(name.to_string(), actions)]);
                }
            }
            self.recheck_dependencies(id, false);
        }
        self.reprioritize_all();
    }

    /// Re-offer a DEPEND job's outstanding dependencies to the stack.
    /// With `raise_unhandled`, a scheme nobody claims raises the nonfatal
    /// dependency exception (the restart path wants this; a plugin load
    /// does not, since another plugin may still handle it).
    pub(crate) fn recheck_dependencies(&mut self, id: JobId, raise_unhandled: bool) {
        let descriptions: Vec<String> = match self.jobs.active(id) {
            Some(job) => job.dependencies.iter().map(str::to_string).collect(),
            None => return,
        };
        for description in descriptions {
            let (scheme, value) = match description.split_once(':') {
                Some((scheme, value)) => (scheme.to_string(), Value::String(value.to_string())),
                None => (description.clone(), Value::Null),
            };
            let (outcome, actions) = {
                let Some(job) = self.jobs.active(id) else {
                    return;
                };
                self.jobtap.call_dependency(job, &scheme, &value)
            };
            self.apply_stack_actions(id, actions);
            if raise_unhandled && outcome == DependencyOutcome::Unhandled {
                if let Err(e) = self.post_exception(
                    id,
                    "dependency",
                    4,
                    None,
                    &format!("dependency scheme \"{scheme}\" not supported"),
                ) {
                    error!(id = %id, "dependency exception failed: {e}");
                }
            }
        }
    }

    /// Destroy a plugin's per-job attachments and subscriptions before
    /// the plugin itself goes away, so nothing dangles.
    pub(crate) fn plugin_unload(&mut self, name: &str) {
        let mut abandoned = 0;
        for job in self.jobs.iter_active_mut() {
            abandoned += job.aux_unload_plugin(name);
            job.subscribers.remove(name);
        }
        for job in self.jobs.iter_inactive_mut() {
            abandoned += job.aux_unload_plugin(name);
            job.subscribers.remove(name);
        }
        if abandoned > 0 {
            error!(plugin = %name, abandoned, "destroyed job attachments on plugin unload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;

    struct Veto {
        name: String,
        msg: String,
    }

    impl Plugin for Veto {
        fn name(&self) -> &str {
            &self.name
        }

        fn job_validate(&mut self, _job: &Job, _jobspec: &Value) -> Result<(), String> {
            Err(self.msg.clone())
        }
    }

    struct Fixed {
        name: String,
        priority: i64,
    }

    impl Plugin for Fixed {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority_get(&mut self, _job: &Job) -> Option<PriorityResult> {
            Some(PriorityResult::Value(self.priority))
        }
    }

    fn job() -> Job {
        Job::new(JobId(1), 0)
    }

    #[test]
    fn validate_surfaces_plugin_message() {
        let mut host = JobtapHost::new();
        host.load(Box::new(Veto {
            name: "strict".to_string(),
            msg: "no jobs on tuesdays".to_string(),
        }));
        let err = host.call_validate(&job(), &Value::Null).unwrap_err();
        assert_eq!(err.plugin, "strict");
        assert_eq!(err.errmsg, "no jobs on tuesdays");
    }

    #[test]
    fn empty_rejection_message_gets_generic_text() {
        let mut host = JobtapHost::new();
        host.load(Box::new(Veto {
            name: "mute".to_string(),
            msg: String::new(),
        }));
        let err = host.call_validate(&job(), &Value::Null).unwrap_err();
        assert_eq!(err.errmsg, "rejected by plugin");
    }

    #[test]
    fn later_priority_plugin_overrides_earlier() {
        let mut host = JobtapHost::new();
        host.load_builtin(".priority-default").unwrap();
        host.load(Box::new(Fixed {
            name: "site-priority".to_string(),
            priority: 1000,
        }));
        assert_eq!(
            host.get_priority(&job()),
            Some(PriorityResult::Value(1000))
        );
    }

    #[test]
    fn reloading_a_plugin_replaces_it_in_place() {
        let mut host = JobtapHost::new();
        host.load(Box::new(Fixed {
            name: "p".to_string(),
            priority: 1,
        }));
        host.load(Box::new(Fixed {
            name: "p".to_string(),
            priority: 2,
        }));
        assert_eq!(host.names(), vec!["p".to_string()]);
        assert_eq!(host.get_priority(&job()), Some(PriorityResult::Value(2)));
    }

    #[test]
    fn unknown_builtin_is_an_error() {
        let mut host = JobtapHost::new();
        assert!(host.load_builtin(".does-not-exist").is_err());
    }

    #[test]
    fn unhandled_dependency_scheme_reported() {
        let mut host = JobtapHost::new();
        host.load_builtin(".priority-default").unwrap();
        let (outcome, _) = host.call_dependency(&job(), "afterok", &Value::Null);
        assert_eq!(outcome, DependencyOutcome::Unhandled);
    }

    #[test]
    fn event_delivery_respects_subscriptions() {
        struct Counting {
            seen: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        }
        impl Plugin for Counting {
            fn name(&self) -> &str {
                "counting"
            }
            fn job_event(
                &mut self,
                _job: &Job,
                _entry: &EventEntry,
                _actions: &mut Actions,
            ) -> Result<(), String> {
                self.seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut host = JobtapHost::new();
        host.load(Box::new(Counting { seen: seen.clone() }));

        let mut job = job();
        let entry = EventEntry::at(1.0, "urgency", serde_json::json!({"urgency": 2}));
        host.call_event(&job, &entry);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 0);

        job.subscribers.insert("counting".to_string());
        host.call_event(&job, &entry);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
