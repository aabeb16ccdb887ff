//! Run configuration: project file merged with command-line overrides.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::project::ProjectConfig;
use crate::run_loop::LoopConfig;

/// Where the session's events live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Memory,
    Sqlite(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Project root directory (directory containing .planloop.toml).
    pub project_root: PathBuf,
    pub stream: StreamTarget,
    /// Retries for a failed step.
    pub max_retries: u32,
    pub action_timeout: Duration,
    pub max_actions_per_step: usize,
}

impl Config {
    /// Build config from run command args and project config.
    pub fn from_run_args(
        project: ProjectConfig,
        max_retries_override: Option<u32>,
        timeout_override: Option<u64>,
        memory: bool,
    ) -> Result<Self> {
        let execution = &project.config.execution;

        let timeout_secs = timeout_override.unwrap_or(execution.action_timeout_secs);
        if timeout_secs == 0 {
            bail!("action timeout must be at least one second");
        }
        if execution.max_actions_per_step == 0 {
            bail!("max_actions_per_step must be at least 1");
        }

        let stream = if memory {
            StreamTarget::Memory
        } else {
            StreamTarget::Sqlite(project.events_db())
        };

        Ok(Config {
            max_retries: max_retries_override.unwrap_or(execution.max_retries),
            action_timeout: Duration::from_secs(timeout_secs),
            max_actions_per_step: execution.max_actions_per_step,
            stream,
            project_root: project.root,
        })
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_retries: self.max_retries,
            action_timeout: self.action_timeout,
            max_actions_per_step: self.max_actions_per_step,
        }
    }
}
