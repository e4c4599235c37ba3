//! Ring of recently seen jobs, exposed through `plugin.query`.

use std::collections::VecDeque;

use serde_json::{json, Value};

use crate::ids::JobId;
use crate::job::Job;
use crate::jobtap::{Actions, Plugin};

const DEFAULT_CAPACITY: usize = 1000;

pub struct History {
    capacity: usize,
    entries: VecDeque<(f64, JobId)>,
}

impl History {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for History {
    fn name(&self) -> &str {
        ".history"
    }

    fn job_new(&mut self, job: &Job, _actions: &mut Actions) -> Result<(), String> {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((job.t_submit, job.id));
        Ok(())
    }

    fn query(&self) -> Value {
        let jobs: Vec<Value> = self
            .entries
            .iter()
            .map(|(t_submit, id)| json!([t_submit, id.0]))
            .collect();
        json!({ "njobs": self.entries.len(), "jobs": jobs })
    }
}
