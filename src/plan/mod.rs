//! Plans, steps, and the planning tool that owns them.
//!
//! A [`Plan`] is only mutated through [`PlanningTool`]; every status change
//! goes through [`Plan::set_step_status`], which enforces the transition
//! table in [`transitions`] and the single in-progress step rule.

pub mod format;
pub mod transitions;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

pub use transitions::is_valid_transition;

/// Status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(StepStatus::NotStarted),
            "in_progress" => Ok(StepStatus::InProgress),
            "completed" => Ok(StepStatus::Completed),
            "blocked" => Ok(StepStatus::Blocked),
            other => Err(PlanError::InvalidPlan(format!("unknown step status '{other}'"))),
        }
    }
}

/// One unit of planned work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    index: usize,
    description: String,
    status: StepStatus,
    result: Option<String>,
    notes: String,
    attempts: u32,
}

impl Step {
    fn new(index: usize, description: String) -> Self {
        Step {
            index,
            description,
            status: StepStatus::NotStarted,
            result: None,
            notes: String::new(),
            attempts: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// How many times this step has entered `in_progress`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Per-status step counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub not_started: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn tally(statuses: impl IntoIterator<Item = StepStatus>) -> Self {
        let mut counts = StatusCounts::default();
        for status in statuses {
            match status {
                StepStatus::NotStarted => counts.not_started += 1,
                StepStatus::InProgress => counts.in_progress += 1,
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }
}

/// An ordered decomposition of a goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    id: String,
    title: String,
    steps: Vec<Step>,
}

impl Plan {
    fn new(id: String, title: String, steps: Vec<String>) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::InvalidPlan("a plan needs at least one step".into()));
        }
        if title.trim().is_empty() {
            return Err(PlanError::InvalidPlan("a plan needs a title".into()));
        }
        if let Some(blank) = steps.iter().position(|s| s.trim().is_empty()) {
            return Err(PlanError::InvalidPlan(format!("step {blank} has no description")));
        }
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, description)| Step::new(index, description))
            .collect();
        Ok(Plan { id, title, steps })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Result<&Step, PlanError> {
        self.steps.get(index).ok_or(PlanError::Index {
            index,
            len: self.steps.len(),
        })
    }

    /// The step currently in progress, if any.
    pub fn in_progress(&self) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
            .map(|s| s.index)
    }

    /// True iff every step is completed.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// (`completed`, `total`).
    pub fn progress(&self) -> (usize, usize) {
        (self.status_counts().completed, self.steps.len())
    }

    pub fn status_counts(&self) -> StatusCounts {
        StatusCounts::tally(self.steps.iter().map(|s| s.status))
    }

    /// First step, in index order, that is not started or blocked.
    pub fn next_runnable(&self) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::NotStarted | StepStatus::Blocked))
            .map(|s| s.index)
    }

    /// Immutable copy of the plan's current state.
    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            plan_id: self.id.clone(),
            goal: self.title.clone(),
            steps: self
                .steps
                .iter()
                .map(|s| StepSnapshot {
                    index: s.index,
                    description: s.description.clone(),
                    status: s.status,
                    result: s.result.clone(),
                    notes: s.notes.clone(),
                })
                .collect(),
        }
    }

    fn set_step_status(
        &mut self,
        index: usize,
        status: StepStatus,
        result: Option<String>,
    ) -> Result<(), PlanError> {
        let from = self.step(index)?.status;
        if !is_valid_transition(from, status) {
            return Err(PlanError::InvalidTransition {
                index,
                from,
                to: status,
            });
        }
        if result.is_some() && status != StepStatus::Completed {
            return Err(PlanError::UnexpectedResult { index });
        }
        if status == StepStatus::InProgress {
            if let Some(active) = self.in_progress() {
                return Err(PlanError::Conflict { index, active });
            }
        }

        let step = &mut self.steps[index];
        step.status = status;
        if status == StepStatus::InProgress {
            step.attempts += 1;
        }
        if result.is_some() {
            step.result = result;
        }
        Ok(())
    }

    fn set_step_notes(&mut self, index: usize, notes: String) -> Result<(), PlanError> {
        let len = self.steps.len();
        let step = self
            .steps
            .get_mut(index)
            .ok_or(PlanError::Index { index, len })?;
        step.notes = notes;
        Ok(())
    }

    fn amend(&mut self, steps: Vec<String>) -> Result<std::ops::Range<usize>, PlanError> {
        if let Some(blank) = steps.iter().position(|s| s.trim().is_empty()) {
            return Err(PlanError::InvalidPlan(format!(
                "amended step {blank} has no description"
            )));
        }
        let start = self.steps.len();
        for description in steps {
            let index = self.steps.len();
            self.steps.push(Step::new(index, description));
        }
        Ok(start..self.steps.len())
    }
}

/// Serializable view of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

/// Serializable view of a plan, mirrored into the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan_id: String,
    pub goal: String,
    pub steps: Vec<StepSnapshot>,
}

impl PlanSnapshot {
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    pub fn render(&self) -> String {
        format::render(self)
    }
}

/// One line of [`PlanningTool::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub plan_id: String,
    pub title: String,
    pub completed: usize,
    pub total: usize,
    pub active: bool,
}

/// Stores plans by id and tracks the active one.
#[derive(Debug, Default)]
pub struct PlanningTool {
    plans: Vec<Plan>,
    active: Option<String>,
}

impl PlanningTool {
    pub fn new() -> Self {
        PlanningTool::default()
    }

    /// Create a plan and make it active.
    ///
    /// Without an explicit id, one is derived from the current time.
    pub fn create_plan(
        &mut self,
        plan_id: Option<&str>,
        goal: &str,
        steps: Vec<String>,
    ) -> Result<&Plan, PlanError> {
        let id = match plan_id {
            Some(id) => {
                if self.find(id).is_some() {
                    return Err(PlanError::DuplicatePlan(id.to_string()));
                }
                id.to_string()
            }
            None => self.generate_id(),
        };
        let plan = Plan::new(id.clone(), goal.to_string(), steps)?;
        self.plans.push(plan);
        self.active = Some(id);
        let last = self.plans.len() - 1;
        Ok(&self.plans[last])
    }

    pub fn get(&self, plan_id: &str) -> Result<&Plan, PlanError> {
        self.find(plan_id)
            .map(|i| &self.plans[i])
            .ok_or_else(|| PlanError::PlanNotFound(plan_id.to_string()))
    }

    pub fn active_plan_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_plan(&self) -> Result<&Plan, PlanError> {
        let id = self.active_id()?;
        self.get(id)
    }

    pub fn set_active(&mut self, plan_id: &str) -> Result<(), PlanError> {
        self.get(plan_id)?;
        self.active = Some(plan_id.to_string());
        Ok(())
    }

    /// Plans in creation order with their progress.
    pub fn list(&self) -> Vec<PlanSummary> {
        self.plans
            .iter()
            .map(|plan| {
                let (completed, total) = plan.progress();
                PlanSummary {
                    plan_id: plan.id.clone(),
                    title: plan.title.clone(),
                    completed,
                    total,
                    active: self.active.as_deref() == Some(plan.id.as_str()),
                }
            })
            .collect()
    }

    /// Remove a plan. A plan with incomplete steps is kept unless `force`.
    pub fn delete(&mut self, plan_id: &str, force: bool) -> Result<Plan, PlanError> {
        let pos = self
            .find(plan_id)
            .ok_or_else(|| PlanError::PlanNotFound(plan_id.to_string()))?;
        if !force && !self.plans[pos].is_complete() {
            return Err(PlanError::Incomplete(plan_id.to_string()));
        }
        let plan = self.plans.remove(pos);
        if self.active.as_deref() == Some(plan_id) {
            self.active = self.plans.first().map(|p| p.id.clone());
        }
        Ok(plan)
    }

    /// Update one step of the active plan.
    pub fn set_step_status(
        &mut self,
        index: usize,
        status: StepStatus,
        result: Option<String>,
    ) -> Result<&Step, PlanError> {
        let plan = self.active_mut()?;
        plan.set_step_status(index, status, result)?;
        Ok(&plan.steps[index])
    }

    pub fn set_step_notes(&mut self, index: usize, notes: impl Into<String>) -> Result<(), PlanError> {
        self.active_mut()?.set_step_notes(index, notes.into())
    }

    /// Append steps to the active plan. Returns the new indices.
    pub fn amend(&mut self, steps: Vec<String>) -> Result<std::ops::Range<usize>, PlanError> {
        self.active_mut()?.amend(steps)
    }

    pub fn snapshot(&self) -> Result<PlanSnapshot, PlanError> {
        Ok(self.active_plan()?.snapshot())
    }

    fn find(&self, plan_id: &str) -> Option<usize> {
        self.plans.iter().position(|p| p.id == plan_id)
    }

    fn active_id(&self) -> Result<&str, PlanError> {
        self.active
            .as_deref()
            .ok_or_else(|| PlanError::PlanNotFound("<no active plan>".to_string()))
    }

    fn active_mut(&mut self) -> Result<&mut Plan, PlanError> {
        let id = self.active_id()?.to_string();
        let pos = self.find(&id).ok_or(PlanError::PlanNotFound(id))?;
        Ok(&mut self.plans[pos])
    }

    fn generate_id(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let base = format!("plan_{secs}");
        let mut candidate = base.clone();
        let mut n = 2;
        while self.find(&candidate).is_some() {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        candidate
    }
}
