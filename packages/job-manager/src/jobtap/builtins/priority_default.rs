//! Default urgency-to-priority policy.
//!
//! Absent a site priority plugin, a job's priority is its urgency, with
//! the reserved hold and expedite urgencies pinned to the priority range
//! ends. Loaded first, so any later plugin with an opinion overrides it.

use crate::job::{
    Job, PRIORITY_MAX, PRIORITY_MIN, URGENCY_EXPEDITE, URGENCY_HOLD,
};
use crate::jobtap::{Plugin, PriorityResult};

#[derive(Default)]
pub struct PriorityDefault;

impl PriorityDefault {
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for PriorityDefault {
    fn name(&self) -> &str {
        ".priority-default"
    }

    fn priority_get(&mut self, job: &Job) -> Option<PriorityResult> {
        let priority = match job.urgency {
            URGENCY_HOLD => PRIORITY_MIN,
            URGENCY_EXPEDITE => PRIORITY_MAX,
            urgency => i64::from(urgency),
        };
        Some(PriorityResult::Value(priority))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use crate::job::URGENCY_DEFAULT;

    fn job_with_urgency(urgency: i32) -> Job {
        let mut job = Job::new(JobId(1), 0);
        job.urgency = urgency;
        job
    }

    #[test]
    fn default_urgency_maps_to_itself() {
        let mut plugin = PriorityDefault::new();
        assert_eq!(
            plugin.priority_get(&job_with_urgency(URGENCY_DEFAULT)),
            Some(PriorityResult::Value(16))
        );
    }

    #[test]
    fn hold_maps_to_minimum_priority() {
        let mut plugin = PriorityDefault::new();
        assert_eq!(
            plugin.priority_get(&job_with_urgency(URGENCY_HOLD)),
            Some(PriorityResult::Value(PRIORITY_MIN))
        );
    }

    #[test]
    fn expedite_maps_to_maximum_priority() {
        let mut plugin = PriorityDefault::new();
        assert_eq!(
            plugin.priority_get(&job_with_urgency(URGENCY_EXPEDITE)),
            Some(PriorityResult::Value(PRIORITY_MAX))
        );
    }
}
