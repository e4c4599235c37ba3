//! Policy configuration consumed by the core.
//!
//! The host hands the core a decoded configuration document. Only the keys
//! that affect core behavior are modeled; everything else stays with the
//! host. Reconfiguration re-enters through [`crate::manager::JobManager`]
//! which fans `conf.update` out to loaded plugins.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: {0}")]
    Invalid(String),

    #[error("config: bad duration '{value}': {source}")]
    BadDuration {
        value: String,
        source: humantime::DurationError,
    },
}

/// `queues.<name>` table entry.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Resource properties merged into the constraints of every job
    /// submitted to this queue.
    #[serde(default)]
    pub requires: Vec<String>,
}

/// Partial-release policy for housekeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseAfter {
    /// Hold everything until the last execution target completes.
    #[default]
    Never,
    /// Release each target's resources as it completes.
    Immediate,
    /// Arm a one-shot timer at the first completion; release completed
    /// targets when it fires, then per-completion.
    After(Duration),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct HousekeepingConfig {
    /// Script argv; when absent and an IMP path is configured the command
    /// defaults to `[imp, "run", "housekeeping"]`.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    #[serde(default, rename = "release-after")]
    pub release_after: Option<String>,
}

impl HousekeepingConfig {
    pub fn parsed_release_after(&self) -> Result<ReleaseAfter, ConfigError> {
        match self.release_after.as_deref() {
            None => Ok(ReleaseAfter::Never),
            Some(raw) => parse_release_after(raw),
        }
    }

    pub fn resolved_command(&self, imp_path: Option<&str>) -> Option<Vec<String>> {
        if let Some(argv) = &self.command {
            return Some(argv.clone());
        }
        imp_path.map(|imp| {
            vec![
                imp.to_string(),
                "run".to_string(),
                "housekeeping".to_string(),
            ]
        })
    }
}

fn parse_release_after(raw: &str) -> Result<ReleaseAfter, ConfigError> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('-') {
        // Any negative duration means "never partial".
        humantime::parse_duration(rest).map_err(|source| ConfigError::BadDuration {
            value: raw.to_string(),
            source,
        })?;
        return Ok(ReleaseAfter::Never);
    }
    let duration =
        humantime::parse_duration(trimmed).map_err(|source| ConfigError::BadDuration {
            value: raw.to_string(),
            source,
        })?;
    if duration.is_zero() {
        Ok(ReleaseAfter::Immediate)
    } else {
        Ok(ReleaseAfter::After(duration))
    }
}

/// `limits` keys consumed by the `.limit-job-size` builtin.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct JobSizeLimits {
    #[serde(default)]
    pub max_nnodes: Option<u64>,
    #[serde(default)]
    pub max_ncores: Option<u64>,
}

/// Jobspec defaults applied at submit when the submission is silent.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct JobspecDefaults {
    #[serde(default)]
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    /// Named queues. Empty means the single anonymous queue.
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,

    #[serde(default)]
    pub housekeeping: Option<HousekeepingConfig>,

    /// Plugins to load at startup; builtins are named with a leading dot.
    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default)]
    pub limits: Option<JobSizeLimits>,

    #[serde(default)]
    pub defaults: JobspecDefaults,

    /// Path to the IMP used to build the default housekeeping command.
    #[serde(default)]
    pub imp_path: Option<String>,
}

impl Config {
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
