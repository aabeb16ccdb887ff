//! Main planning loop.
//!
//! One request becomes one plan; each step is translated into actions
//! which are dispatched one at a time, each awaited until its observation
//! lands in the session's event stream.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::LoopError;
use crate::event::{Action, ActionKind, Observation};
use crate::executor::{self, Executor};
use crate::plan::{PlanningTool, StepStatus};
use crate::planner::Planner;
use crate::report::{Report, ReportSink};
use crate::session::Session;
use crate::state::AgentState;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_ACTIONS_PER_STEP: usize = 8;

/// Limits applied by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Retries granted to a step after its first failed attempt.
    pub max_retries: u32,
    /// How long to wait for the observation of one action.
    pub action_timeout: Duration,
    pub max_actions_per_step: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            max_actions_per_step: DEFAULT_MAX_ACTIONS_PER_STEP,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every step completed
    Finished { summary: String },
    /// A step ran out of retries
    Blocked { step: usize },
    /// The operator stopped the session
    Stopped,
}

enum StepOutcome {
    Completed(String),
    Failed(String),
    Stopped,
}

enum ActionOutcome {
    Output(String),
    Failed(String),
    Stopped,
}

pub struct PlanningLoop {
    config: LoopConfig,
    executor: Arc<dyn Executor>,
    planner: Arc<dyn Planner>,
    reports: ReportSink,
    tool: PlanningTool,
}

impl PlanningLoop {
    pub fn new(
        config: LoopConfig,
        executor: Arc<dyn Executor>,
        planner: Arc<dyn Planner>,
        reports: ReportSink,
    ) -> Self {
        PlanningLoop {
            config,
            executor,
            planner,
            reports,
            tool: PlanningTool::new(),
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Plans created so far, read-only.
    pub fn plans(&self) -> &PlanningTool {
        &self.tool
    }

    /// Plan and execute `request` within `session`.
    ///
    /// Step failures are reported and retried; only fatal conditions and
    /// caller defects come back as `Err`. On any error the session is left
    /// in the `error` state.
    pub async fn run(&mut self, session: &mut Session, request: &str) -> Result<Outcome, LoopError> {
        let state = session.state();
        if state.is_terminal() {
            return Err(LoopError::State(format!(
                "session {} is already {state}",
                session.id()
            )));
        }
        if !matches!(state, AgentState::Init | AgentState::Error) {
            return Err(LoopError::State(format!(
                "session {} is already active ({state})",
                session.id()
            )));
        }

        match self.drive(session, request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(session_id = %session.id(), error = %err, "planning loop failed");
                let stream = session.stream().clone();
                // Already logged by the state machine when the stream is gone.
                session.state_machine().force_error(&stream).ok();
                let step = self.tool.active_plan().ok().and_then(|p| p.in_progress());
                self.reports.emit(Report::error(step, err.to_string()));
                Err(err)
            }
        }
    }

    async fn drive(&mut self, session: &mut Session, request: &str) -> Result<Outcome, LoopError> {
        let stream = session.stream().clone();
        let control = session.control();

        session.state_machine().transition(AgentState::Running, &stream)?;
        stream.append(Action::user_message(request))?;

        info!(session_id = %session.id(), "creating plan");
        let draft = self.planner.create_plan(request).await?;
        let plan_id = self.tool.create_plan(None, &draft.goal, draft.steps)?.id().to_string();
        info!(session_id = %session.id(), plan_id = %plan_id, "plan created");
        self.publish_plan(session)?;

        loop {
            if control.is_stopped() {
                return self.stop(session, None);
            }
            let plan = self.tool.active_plan()?;
            if plan.is_complete() {
                break;
            }
            let Some(index) = plan.next_runnable() else {
                // Nothing left to pick although the plan is incomplete.
                let step = plan.in_progress().unwrap_or_default();
                session.state_machine().transition(AgentState::Error, &stream)?;
                return Ok(Outcome::Blocked { step });
            };

            self.tool.set_step_status(index, StepStatus::InProgress, None)?;
            info!(
                session_id = %session.id(),
                step = index,
                attempt = self.tool.active_plan()?.step(index)?.attempts(),
                "step started"
            );
            self.publish_plan(session)?;

            match self.run_step(session, index).await? {
                StepOutcome::Completed(result) => {
                    self.tool
                        .set_step_status(index, StepStatus::Completed, Some(result))?;
                    info!(session_id = %session.id(), step = index, "step completed");
                    self.publish_plan(session)?;
                }
                StepOutcome::Failed(reason) => {
                    self.tool.set_step_status(index, StepStatus::Blocked, None)?;
                    self.tool.set_step_notes(index, reason.as_str())?;
                    self.publish_plan(session)?;
                    self.reports
                        .emit(Report::error(Some(index), format!("Step {index} failed: {reason}")));

                    let attempts = self.tool.active_plan()?.step(index)?.attempts();
                    let retries_used = attempts.saturating_sub(1);
                    if retries_used < self.config.max_retries {
                        warn!(
                            session_id = %session.id(),
                            step = index,
                            retries_used,
                            reason = %reason,
                            "step failed, retrying"
                        );
                        continue;
                    }
                    warn!(session_id = %session.id(), step = index, reason = %reason, "step blocked");
                    session.state_machine().transition(AgentState::Error, &stream)?;
                    return Ok(Outcome::Blocked { step: index });
                }
                StepOutcome::Stopped => return self.stop(session, Some(index)),
            }
        }

        let snapshot = self.tool.snapshot()?;
        let summary = match self.planner.summarize(request, &snapshot).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(session_id = %session.id(), error = %err, "summary failed");
                format!(
                    "The plan has been completed, but an error occurred while creating the summary: {err}"
                )
            }
        };
        self.reports.emit(Report::final_answer(summary.as_str()));
        stream.append(Action::finish(json!({ "summary": summary })))?;
        session.state_machine().transition(AgentState::Finished, &stream)?;
        info!(session_id = %session.id(), "session finished");
        Ok(Outcome::Finished { summary })
    }

    async fn run_step(&mut self, session: &mut Session, index: usize) -> Result<StepOutcome, LoopError> {
        let control = session.control();
        let snapshot = self.tool.snapshot()?;
        let step = snapshot.steps.get(index).cloned().ok_or(crate::error::PlanError::Index {
            index,
            len: snapshot.steps.len(),
        })?;

        let mut actions = match self.planner.actions_for(&step, &snapshot).await {
            Ok(actions) => actions,
            Err(err) => return Ok(StepOutcome::Failed(format!("could not translate step: {err}"))),
        };
        if actions.is_empty() {
            return Ok(StepOutcome::Failed("step produced no actions".to_string()));
        }
        if actions.len() > self.config.max_actions_per_step {
            warn!(
                step = index,
                produced = actions.len(),
                limit = self.config.max_actions_per_step,
                "truncating step actions"
            );
            actions.truncate(self.config.max_actions_per_step);
        }

        let mut outputs = Vec::new();
        for action in actions {
            if control.is_pause_requested() && !self.pause(session).await? {
                return Ok(StepOutcome::Stopped);
            }
            if control.is_stopped() {
                return Ok(StepOutcome::Stopped);
            }
            match self.perform(session, action).await? {
                ActionOutcome::Output(text) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        outputs.push(text.to_string());
                    }
                }
                ActionOutcome::Failed(reason) => return Ok(StepOutcome::Failed(reason)),
                ActionOutcome::Stopped => return Ok(StepOutcome::Stopped),
            }
        }
        Ok(StepOutcome::Completed(outputs.join("\n")))
    }

    /// Returns `false` when stopped while paused.
    async fn pause(&mut self, session: &mut Session) -> Result<bool, LoopError> {
        let stream = session.stream().clone();
        let control = session.control();
        session.state_machine().transition(AgentState::Paused, &stream)?;
        info!(session_id = %session.id(), "paused");
        if !control.wait_resumed().await {
            return Ok(false);
        }
        session.state_machine().transition(AgentState::Running, &stream)?;
        info!(session_id = %session.id(), "resumed");
        Ok(true)
    }

    async fn perform(&mut self, session: &mut Session, action: Action) -> Result<ActionOutcome, LoopError> {
        let stream = session.stream().clone();
        let control = session.control();

        if action.wait_for_response() {
            let asked = stream.append(action)?;
            session
                .state_machine()
                .transition(AgentState::AwaitingUserInput, &stream)?;
            debug!(event_id = asked.id().0, "waiting for user reply");
            let reply = tokio::select! {
                biased;
                _ = control.stopped() => return Ok(ActionOutcome::Stopped),
                reply = stream.wait_for_user_message(asked.id().next()) => reply?,
            };
            session.state_machine().transition(AgentState::Running, &stream)?;
            let text = reply.as_action().map(Action::message).unwrap_or_default();
            return Ok(ActionOutcome::Output(text));
        }

        let kind = action.kind();
        let event = stream.append(action)?;
        if !kind.is_runnable() {
            let text = match kind {
                ActionKind::Message => event.as_action().map(Action::message).unwrap_or_default(),
                _ => String::new(),
            };
            return Ok(ActionOutcome::Output(text));
        }

        debug!(event_id = event.id().0, kind = %kind, "dispatching action");
        let handle = executor::dispatch(self.executor.clone(), stream.clone(), event.clone());
        let waited = tokio::select! {
            biased;
            _ = control.stopped() => None,
            waited = tokio::time::timeout(
                self.config.action_timeout,
                stream.wait_for_observation(event.id()),
            ) => Some(waited),
        };
        let Some(waited) = waited else {
            handle.abort();
            return Ok(ActionOutcome::Stopped);
        };

        match waited {
            Err(_) => {
                handle.abort();
                let timeout = self.config.action_timeout;
                let secs = timeout.as_secs();
                warn!(event_id = event.id().0, ?timeout, "action timed out");
                stream.append(
                    Observation::error(format!("timed out after {timeout:?}")).with_cause(event.id()),
                )?;
                Ok(ActionOutcome::Failed(
                    LoopError::Timeout {
                        action: event.id(),
                        secs,
                    }
                    .to_string(),
                ))
            }
            Ok(observed) => {
                let observed = observed?;
                let Some(observation) = observed.as_observation() else {
                    return Ok(ActionOutcome::Failed(format!(
                        "event {} is not an observation",
                        observed.id()
                    )));
                };
                match observation.failure() {
                    Some(reason) => Ok(ActionOutcome::Failed(reason)),
                    None => Ok(ActionOutcome::Output(observation.content().to_string())),
                }
            }
        }
    }

    fn stop(&mut self, session: &mut Session, step: Option<usize>) -> Result<Outcome, LoopError> {
        let stream = session.stream().clone();
        if let Some(index) = step {
            self.tool.set_step_status(index, StepStatus::Blocked, None)?;
            self.tool.set_step_notes(index, "stopped by operator")?;
            self.publish_plan(session)?;
        }
        session.state_machine().transition(AgentState::Stopped, &stream)?;
        info!(session_id = %session.id(), "session stopped");
        Ok(Outcome::Stopped)
    }

    /// Mirror the active plan into the stream and publish it.
    fn publish_plan(&self, session: &Session) -> Result<(), LoopError> {
        let snapshot = self.tool.snapshot()?;
        let value = serde_json::to_value(&snapshot).unwrap_or_default();
        session
            .stream()
            .append(Observation::plan_status(snapshot.render(), value))?;
        self.reports.emit(Report::planning(snapshot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::StaticPlanner;
    use crate::executor::ShellExecutor;

    fn planning_loop(steps: &[&str]) -> PlanningLoop {
        let planner = StaticPlanner::new(steps.iter().map(|s| s.to_string()).collect());
        PlanningLoop::new(
            LoopConfig::default(),
            Arc::new(ShellExecutor::new(std::env::temp_dir())),
            Arc::new(planner),
            ReportSink::new(),
        )
    }

    #[test]
    fn default_limits() {
        let config = LoopConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.action_timeout, Duration::from_secs(120));
        assert_eq!(config.max_actions_per_step, 8);
    }

    #[tokio::test]
    async fn thinking_steps_finish_the_session() {
        let mut session = Session::in_memory();
        let mut lp = planning_loop(&["[THINK] look around", "[THINK] wrap up"]);
        let outcome = lp.run(&mut session, "ponder").await.unwrap();

        let Outcome::Finished { summary } = outcome else {
            panic!("expected finished, got {outcome:?}");
        };
        assert!(summary.contains("0. [THINK] look around: look around"), "{summary}");
        assert_eq!(session.state(), AgentState::Finished);
        assert!(lp.plans().active_plan().unwrap().is_complete());
    }

    #[tokio::test]
    async fn finished_session_refuses_to_run_again() {
        let mut session = Session::in_memory();
        let mut lp = planning_loop(&["[THINK] once"]);
        lp.run(&mut session, "once").await.unwrap();

        let err = lp.run(&mut session, "again").await.unwrap_err();
        assert!(matches!(err, LoopError::State(_)), "{err:?}");
        assert_eq!(session.state(), AgentState::Finished);
    }

    #[tokio::test]
    async fn empty_plan_is_a_caller_error() {
        let mut session = Session::in_memory();
        let mut lp = planning_loop(&[]);
        let err = lp.run(&mut session, "nothing").await.unwrap_err();
        assert!(matches!(err, LoopError::Plan(_)), "{err:?}");
        assert_eq!(session.state(), AgentState::Error);
    }
}
