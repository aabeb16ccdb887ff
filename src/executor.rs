//! Executors turn dispatched actions into observations.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{ExecutorError, StreamError};
use crate::event::{Action, ActionKind, Event, Observation};
use crate::stream::EventStream;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Carry out a stored action and describe what happened.
    async fn execute(&self, action: &Event) -> Result<Observation, ExecutorError>;
}

/// Run `action` on a background task that appends the resulting observation.
///
/// Executor errors become `error` observations. The handle can be aborted
/// to cancel the work.
pub fn dispatch(executor: Arc<dyn Executor>, stream: EventStream, action: Event) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cause = action.id();
        let observation = match executor.execute(&action).await {
            Ok(obs) => obs,
            Err(err) => Observation::error(err.to_string()),
        };
        match stream.append(observation.with_cause(cause)) {
            Ok(event) => debug!(cause = cause.0, event_id = event.id().0, "observation recorded"),
            Err(StreamError::Unavailable(reason)) => {
                error!(cause = cause.0, reason = %reason, "could not record observation");
            }
            Err(err) => {
                warn!(cause = cause.0, error = %err, "observation rejected");
                let fallback = Observation::error(format!("executor returned an invalid observation: {err}"));
                if let Err(err) = stream.append(fallback.with_cause(cause)) {
                    error!(cause = cause.0, error = %err, "could not record observation");
                }
            }
        }
    })
}

/// Runs commands and touches files under a working directory.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    workdir: PathBuf,
}

impl ShellExecutor {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        ShellExecutor {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.workdir.join(path)
    }

    async fn run(&self, action: &Action) -> Result<Observation, ExecutorError> {
        let command = required(action, "command")?;
        let argv = shlex::split(command)
            .ok_or_else(|| ExecutorError::Failed(format!("cannot parse command: {command}")))?;
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutorError::Failed("empty command".into()));
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutorError::Failed(format!("failed to spawn '{program}': {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code().unwrap_or(-1) as i64;
        Ok(Observation::run(command, exit_code, text))
    }

    async fn read(&self, action: &Action) -> Result<Observation, ExecutorError> {
        let path = required(action, "path")?;
        let content = tokio::fs::read_to_string(self.resolve(path))
            .await
            .map_err(|e| ExecutorError::Failed(format!("failed to read {path}: {e}")))?;
        Ok(Observation::read(path, content))
    }

    async fn write(&self, action: &Action) -> Result<Observation, ExecutorError> {
        let path = required(action, "path")?;
        let content = required(action, "content")?;
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::Failed(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| ExecutorError::Failed(format!("failed to write {path}: {e}")))?;
        Ok(Observation::write(path))
    }
}

fn required<'a>(action: &'a Action, field: &str) -> Result<&'a str, ExecutorError> {
    action
        .get_str(field)
        .ok_or_else(|| ExecutorError::Failed(format!("{} action has no '{field}'", action.kind())))
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, event: &Event) -> Result<Observation, ExecutorError> {
        let action = event
            .as_action()
            .ok_or_else(|| ExecutorError::Failed(format!("event {} is not an action", event.id())))?;
        match action.kind() {
            ActionKind::Run => self.run(action).await,
            ActionKind::Read => self.read(action).await,
            ActionKind::Write => self.write(action).await,
            ActionKind::Think => Ok(Observation::think(required(action, "thought")?)),
            other => Err(ExecutorError::Unsupported(other.to_string())),
        }
    }
}
