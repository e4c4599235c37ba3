//! Built-in policy plugins, named with a leading dot.

mod history;
mod limit_job_size;
mod priority_default;
mod update_duration;
mod update_queue;

pub use history::History;
pub use limit_job_size::LimitJobSize;
pub use priority_default::PriorityDefault;
pub use update_duration::UpdateDuration;
pub use update_queue::UpdateQueue;

use super::Plugin;

/// Instantiate a builtin by name. Returns None for unknown names.
pub fn create(name: &str) -> Option<Box<dyn Plugin>> {
    match name {
        ".priority-default" => Some(Box::new(PriorityDefault::new())),
        ".update-queue" => Some(Box::new(UpdateQueue::new())),
        ".update-duration" => Some(Box::new(UpdateDuration::new())),
        ".limit-job-size" => Some(Box::new(LimitJobSize::new())),
        ".history" => Some(Box::new(History::new())),
        _ => None,
    }
}

/// The builtins every instance loads before any configured plugin.
pub fn default_names() -> &'static [&'static str] {
    &[
        ".priority-default",
        ".update-queue",
        ".update-duration",
        ".limit-job-size",
        ".history",
    ]
}
