//! Planning seams: deriving a plan, turning steps into actions, summarizing.
//!
//! A [`Planner`] stands in for whatever produces plans (a model, a script,
//! the command line). Step descriptions may carry a tag that maps directly
//! to an action, e.g. `[RUN] cargo fmt` or `[WRITE] notes.md :: hello`.

use async_trait::async_trait;
use tracing::warn;

use crate::error::PlannerError;
use crate::event::Action;
use crate::plan::{PlanSnapshot, StepSnapshot};

/// Steps used when no planner can produce any.
pub const DEFAULT_STEPS: [&str; 3] = ["Analyze the request", "Perform tasks", "Check the result"];

/// Agent name used for untagged steps.
pub const GENERAL_AGENT: &str = "general";

/// Separates path from content in `[WRITE]` steps.
const WRITE_SEPARATOR: &str = " :: ";

/// Goal and ordered step descriptions for a new plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDraft {
    pub goal: String,
    pub steps: Vec<String>,
}

impl PlanDraft {
    /// The plan used when planning produced nothing.
    pub fn fallback(request: &str) -> Self {
        PlanDraft {
            goal: fallback_goal(request),
            steps: DEFAULT_STEPS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, request: &str) -> Result<PlanDraft, PlannerError>;

    /// Actions that carry out one step, in dispatch order.
    async fn actions_for(
        &self,
        step: &StepSnapshot,
        _plan: &PlanSnapshot,
    ) -> Result<Vec<Action>, PlannerError> {
        Ok(translate_step(&step.description))
    }

    /// Final answer once every step has completed.
    async fn summarize(&self, request: &str, plan: &PlanSnapshot) -> Result<String, PlannerError> {
        Ok(default_summary(request, plan))
    }
}

/// Plans from a fixed list of steps.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    goal: Option<String>,
    steps: Vec<String>,
}

impl StaticPlanner {
    pub fn new(steps: Vec<String>) -> Self {
        StaticPlanner { goal: None, steps }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn create_plan(&self, request: &str) -> Result<PlanDraft, PlannerError> {
        Ok(PlanDraft {
            goal: self.goal.clone().unwrap_or_else(|| request.to_string()),
            steps: self.steps.clone(),
        })
    }
}

/// Uses [`PlanDraft::fallback`] when the wrapped planner fails or yields no steps.
#[derive(Debug, Clone)]
pub struct FallbackPlanner<P> {
    inner: P,
}

impl<P: Planner> FallbackPlanner<P> {
    pub fn new(inner: P) -> Self {
        FallbackPlanner { inner }
    }
}

#[async_trait]
impl<P: Planner> Planner for FallbackPlanner<P> {
    async fn create_plan(&self, request: &str) -> Result<PlanDraft, PlannerError> {
        match self.inner.create_plan(request).await {
            Ok(draft) if !draft.steps.is_empty() => Ok(draft),
            Ok(_) => {
                warn!("planner produced no steps, using default plan");
                Ok(PlanDraft::fallback(request))
            }
            Err(err) => {
                warn!(error = %err, "planner failed, using default plan");
                Ok(PlanDraft::fallback(request))
            }
        }
    }

    async fn actions_for(
        &self,
        step: &StepSnapshot,
        plan: &PlanSnapshot,
    ) -> Result<Vec<Action>, PlannerError> {
        self.inner.actions_for(step, plan).await
    }

    async fn summarize(&self, request: &str, plan: &PlanSnapshot) -> Result<String, PlannerError> {
        self.inner.summarize(request, plan).await
    }
}

/// `Plan for: <request>`, truncated to 50 characters.
pub fn fallback_goal(request: &str) -> String {
    let mut chars = request.chars();
    let head: String = chars.by_ref().take(50).collect();
    if chars.next().is_some() {
        format!("Plan for: {head}...")
    } else {
        format!("Plan for: {head}")
    }
}

/// Translate a step description into actions.
///
/// Every non-empty line that starts with a tag becomes one action. A
/// description without any tagged line is delegated as a whole.
pub fn translate_step(description: &str) -> Vec<Action> {
    let tagged: Vec<(&str, &str)> = description
        .lines()
        .filter_map(|line| split_tag(line.trim()))
        .collect();

    if tagged.is_empty() {
        return vec![Action::delegate(GENERAL_AGENT, description.trim())];
    }
    tagged
        .into_iter()
        .map(|(tag, body)| tagged_action(tag, body))
        .collect()
}

fn split_tag(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('[')?;
    let end = rest.find(']')?;
    let tag = &rest[..end];
    if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        return None;
    }
    Some((tag, rest[end + 1..].trim()))
}

fn tagged_action(tag: &str, body: &str) -> Action {
    match tag {
        "RUN" => Action::run(body),
        "IPYTHON" => Action::run_ipython(body),
        "READ" => Action::read(body),
        "WRITE" => {
            let (path, content) = body.split_once(WRITE_SEPARATOR).unwrap_or((body, ""));
            Action::write(path.trim(), content.replace("\\n", "\n"))
        }
        "BROWSE" => Action::browse(body),
        "THINK" => Action::think(body),
        "ASK" => Action::agent_message(body, true),
        other => Action::delegate(other.to_lowercase(), body),
    }
}

/// Deterministic summary listing every step's result.
pub fn default_summary(request: &str, plan: &PlanSnapshot) -> String {
    let mut out = format!("Completed: {request}\n\nStep results:\n");
    for step in &plan.steps {
        let result = step
            .result
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or("(no output)");
        out.push_str(&format!("{}. {}: {}\n", step.index, step.description, result.trim()));
    }
    out
}
