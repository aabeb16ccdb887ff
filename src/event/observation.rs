//! Observations: results of executed actions and unprompted notifications.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{extra_str, require_fields, ActionKind, EventId, EventSource, Extras};
use crate::error::EventError;
use crate::state::AgentState;

/// The fixed set of observation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Run,
    RunIpython,
    Read,
    Write,
    Edit,
    Browse,
    BrowseInteractive,
    Delegate,
    Think,
    AgentStateChanged,
    Error,
    Null,
    PlanStatus,
}

impl ObservationKind {
    pub const ALL: [ObservationKind; 13] = [
        ObservationKind::Run,
        ObservationKind::RunIpython,
        ObservationKind::Read,
        ObservationKind::Write,
        ObservationKind::Edit,
        ObservationKind::Browse,
        ObservationKind::BrowseInteractive,
        ObservationKind::Delegate,
        ObservationKind::Think,
        ObservationKind::AgentStateChanged,
        ObservationKind::Error,
        ObservationKind::Null,
        ObservationKind::PlanStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::Run => "run",
            ObservationKind::RunIpython => "run_ipython",
            ObservationKind::Read => "read",
            ObservationKind::Write => "write",
            ObservationKind::Edit => "edit",
            ObservationKind::Browse => "browse",
            ObservationKind::BrowseInteractive => "browse_interactive",
            ObservationKind::Delegate => "delegate",
            ObservationKind::Think => "think",
            ObservationKind::AgentStateChanged => "agent_state_changed",
            ObservationKind::Error => "error",
            ObservationKind::Null => "null",
            ObservationKind::PlanStatus => "plan_status",
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ObservationKind::Run => &["command", "exit_code"],
            ObservationKind::RunIpython => &["code"],
            ObservationKind::Read => &["path"],
            ObservationKind::Write => &["path"],
            ObservationKind::Edit => &["path", "diff"],
            ObservationKind::Browse => &["url"],
            ObservationKind::BrowseInteractive => &["url"],
            ObservationKind::Delegate => &["outputs"],
            ObservationKind::AgentStateChanged => &["agent_state"],
            ObservationKind::PlanStatus => &["plan"],
            ObservationKind::Think | ObservationKind::Error | ObservationKind::Null => &[],
        }
    }

    /// The action kind this observation answers one-to-one, if any.
    pub fn correlated_action(&self) -> Option<ActionKind> {
        match self {
            ObservationKind::Run => Some(ActionKind::Run),
            ObservationKind::RunIpython => Some(ActionKind::RunIpython),
            ObservationKind::Read => Some(ActionKind::Read),
            ObservationKind::Write => Some(ActionKind::Write),
            ObservationKind::Edit => Some(ActionKind::Edit),
            ObservationKind::Browse => Some(ActionKind::Browse),
            ObservationKind::BrowseInteractive => Some(ActionKind::BrowseInteractive),
            ObservationKind::Delegate => Some(ActionKind::Delegate),
            ObservationKind::Think
            | ObservationKind::AgentStateChanged
            | ObservationKind::Error
            | ObservationKind::Null
            | ObservationKind::PlanStatus => None,
        }
    }

    /// Whether an observation of this kind may be caused by `action`.
    pub fn answers(&self, action: ActionKind) -> bool {
        match self {
            ObservationKind::Error | ObservationKind::Think | ObservationKind::Null => true,
            ObservationKind::AgentStateChanged => action == ActionKind::ChangeAgentState,
            ObservationKind::PlanStatus => false,
            other => other.correlated_action() == Some(action),
        }
    }
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservationKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObservationKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownKind {
                category: "observation",
                kind: s.to_string(),
            })
    }
}

/// The result of an action, or an unprompted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ObservationRecord")]
pub struct Observation {
    kind: ObservationKind,
    source: EventSource,
    content: String,
    extras: Extras,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<EventId>,
}

#[derive(Deserialize)]
struct ObservationRecord {
    kind: ObservationKind,
    source: EventSource,
    #[serde(default)]
    content: String,
    #[serde(default)]
    extras: Extras,
    #[serde(default)]
    cause: Option<EventId>,
}

impl TryFrom<ObservationRecord> for Observation {
    type Error = EventError;

    fn try_from(record: ObservationRecord) -> Result<Self, Self::Error> {
        let obs = Observation::new(record.kind, record.source, record.content, record.extras)?;
        Ok(match record.cause {
            Some(cause) => obs.with_cause(cause),
            None => obs,
        })
    }
}

impl Observation {
    /// Build a validated observation. Users never produce observations.
    pub fn new(
        kind: ObservationKind,
        source: EventSource,
        content: impl Into<String>,
        extras: Extras,
    ) -> Result<Self, EventError> {
        if source == EventSource::User {
            return Err(EventError::InvalidSource {
                category: "observation",
                source_name: source.to_string(),
            });
        }
        require_fields("observation", kind.as_str(), kind.required_fields(), &extras)?;
        Ok(Observation {
            kind,
            source,
            content: content.into(),
            extras,
            cause: None,
        })
    }

    pub fn parse(
        kind: &str,
        source: EventSource,
        content: impl Into<String>,
        extras: Extras,
    ) -> Result<Self, EventError> {
        Observation::new(kind.parse()?, source, content, extras)
    }

    /// Correlate this draft with the action that produced it.
    pub fn with_cause(mut self, cause: EventId) -> Self {
        self.cause = Some(cause);
        self
    }

    fn environment(kind: ObservationKind, content: impl Into<String>, extras: Value) -> Self {
        let extras = match extras {
            Value::Object(map) => map,
            _ => Extras::new(),
        };
        Observation {
            kind,
            source: EventSource::Environment,
            content: content.into(),
            extras,
            cause: None,
        }
    }

    pub fn run(command: impl Into<String>, exit_code: i64, output: impl Into<String>) -> Self {
        Observation::environment(
            ObservationKind::Run,
            output,
            json!({ "command": command.into(), "exit_code": exit_code }),
        )
    }

    pub fn run_ipython(code: impl Into<String>, output: impl Into<String>) -> Self {
        Observation::environment(ObservationKind::RunIpython, output, json!({ "code": code.into() }))
    }

    pub fn read(path: impl Into<String>, content: impl Into<String>) -> Self {
        Observation::environment(ObservationKind::Read, content, json!({ "path": path.into() }))
    }

    pub fn write(path: impl Into<String>) -> Self {
        let path = path.into();
        Observation::environment(
            ObservationKind::Write,
            format!("Wrote {path}"),
            json!({ "path": path }),
        )
    }

    pub fn edit(path: impl Into<String>, diff: impl Into<String>) -> Self {
        let diff = diff.into();
        Observation::environment(
            ObservationKind::Edit,
            diff.clone(),
            json!({ "path": path.into(), "diff": diff }),
        )
    }

    /// Page state after a browse action. `error` is the last action's error, if any.
    pub fn browse(url: impl Into<String>, content: impl Into<String>, error: Option<String>) -> Self {
        let mut extras = json!({ "url": url.into() });
        if let Some(error) = error {
            extras["error"] = Value::String(error);
        }
        Observation::environment(ObservationKind::Browse, content, extras)
    }

    pub fn delegate(outputs: Value) -> Self {
        let content = outputs
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| outputs.to_string());
        Observation::environment(ObservationKind::Delegate, content, json!({ "outputs": outputs }))
    }

    pub fn think(thought: impl Into<String>) -> Self {
        let thought = thought.into();
        Observation::environment(ObservationKind::Think, thought.clone(), json!({ "thought": thought }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Observation::environment(ObservationKind::Error, message, json!({}))
    }

    pub fn null() -> Self {
        Observation::environment(ObservationKind::Null, "", json!({}))
    }

    pub fn agent_state_changed(state: AgentState, previous: AgentState) -> Self {
        Observation::environment(
            ObservationKind::AgentStateChanged,
            format!("Agent state changed to {state}"),
            json!({ "agent_state": state.as_str(), "previous": previous.as_str() }),
        )
    }

    pub fn plan_status(rendered: impl Into<String>, plan: Value) -> Self {
        Observation::environment(ObservationKind::PlanStatus, rendered, json!({ "plan": plan }))
    }

    pub fn kind(&self) -> ObservationKind {
        self.kind
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    pub fn cause(&self) -> Option<EventId> {
        self.cause
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        extra_str(&self.extras, field)
    }

    /// The reported state for `agent_state_changed` observations.
    pub fn agent_state(&self) -> Option<AgentState> {
        if self.kind != ObservationKind::AgentStateChanged {
            return None;
        }
        self.get_str("agent_state").and_then(|s| s.parse().ok())
    }

    /// The failure this observation signals, if any.
    pub fn failure(&self) -> Option<String> {
        if self.kind == ObservationKind::Error {
            return Some(if self.content.is_empty() {
                "unspecified error".to_string()
            } else {
                self.content.clone()
            });
        }
        if let Some(code) = self.extras.get("exit_code").and_then(Value::as_i64) {
            if code != 0 {
                return Some(format!("exited with code {code}: {}", self.content.trim()));
            }
        }
        if let Some(error) = self.get_str("error").filter(|e| !e.is_empty()) {
            return Some(error.to_string());
        }
        if self.extras.get("success").and_then(Value::as_bool) == Some(false) {
            return Some(format!("{} reported failure", self.kind));
        }
        None
    }
}
