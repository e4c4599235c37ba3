//! Config-driven job size limits, enforced at validation time.

use serde_json::Value;

use crate::config::{Config, JobSizeLimits};
use crate::job::Job;
use crate::jobtap::Plugin;

#[derive(Default)]
pub struct LimitJobSize {
    limits: JobSizeLimits,
}

impl LimitJobSize {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Count requested nodes and cores from a jobspec resources tree.
/// Nested counts multiply (`node[2] -> core[4]` asks for 8 cores).
fn count_resources(resources: &Value, multiplier: u64, nnodes: &mut u64, ncores: &mut u64) {
    let Some(entries) = resources.as_array() else {
        return;
    };
    for entry in entries {
        let count = entry.get("count").and_then(Value::as_u64).unwrap_or(1) * multiplier;
        match entry.get("type").and_then(Value::as_str) {
            Some("node") => *nnodes += count,
            Some("core") => *ncores += count,
            _ => {}
        }
        if let Some(children) = entry.get("with") {
            count_resources(children, count, nnodes, ncores);
        }
    }
}

impl Plugin for LimitJobSize {
    fn name(&self) -> &str {
        ".limit-job-size"
    }

    fn conf_update(&mut self, config: &Config) -> Result<(), String> {
        self.limits = config.limits.clone().unwrap_or_default();
        Ok(())
    }

    fn job_validate(&mut self, _job: &Job, jobspec: &Value) -> Result<(), String> {
        let mut nnodes = 0;
        let mut ncores = 0;
        if let Some(resources) = jobspec.get("resources") {
            count_resources(resources, 1, &mut nnodes, &mut ncores);
        }
        if let Some(max) = self.limits.max_nnodes {
            if nnodes > max {
                return Err(format!("job requests {nnodes} nodes, limit is {max}"));
            }
        }
        if let Some(max) = self.limits.max_ncores {
            if ncores > max {
                return Err(format!("job requests {ncores} cores, limit is {max}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use serde_json::json;

    fn plugin_with_limits(max_nnodes: Option<u64>, max_ncores: Option<u64>) -> LimitJobSize {
        let mut plugin = LimitJobSize::new();
        plugin.limits = JobSizeLimits {
            max_nnodes,
            max_ncores,
        };
        plugin
    }

    fn two_node_eight_core_jobspec() -> Value {
        json!({
            "resources": [
                {"type": "node", "count": 2, "with": [
                    {"type": "core", "count": 4}
                ]}
            ]
        })
    }

    #[test]
    fn no_limits_accepts_anything() {
        let mut plugin = LimitJobSize::new();
        let job = Job::new(JobId(1), 0);
        assert!(plugin.job_validate(&job, &two_node_eight_core_jobspec()).is_ok());
    }

    #[test]
    fn nested_core_counts_multiply() {
        let mut plugin = plugin_with_limits(None, Some(7));
        let job = Job::new(JobId(1), 0);
        let err = plugin
            .job_validate(&job, &two_node_eight_core_jobspec())
            .unwrap_err();
        assert!(err.contains("8 cores"), "{err}");
    }

    #[test]
    fn node_limit_enforced() {
        let mut plugin = plugin_with_limits(Some(1), None);
        let job = Job::new(JobId(1), 0);
        assert!(plugin
            .job_validate(&job, &two_node_eight_core_jobspec())
            .is_err());
        assert!(plugin
            .job_validate(&job, &json!({"resources": [{"type": "node", "count": 1}]}))
            .is_ok());
    }

    #[test]
    fn conf_update_refreshes_limits() {
        let mut plugin = LimitJobSize::new();
        let config = Config::from_value(json!({"limits": {"max_nnodes": 4}})).unwrap();
        plugin.conf_update(&config).unwrap();
        assert_eq!(plugin.limits.max_nnodes, Some(4));
    }
}
