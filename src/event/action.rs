//! Actions: intents to act, produced by the agent or the user.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{extra_str, require_fields, EventSource, Extras};
use crate::error::EventError;
use crate::state::AgentState;

/// The fixed set of action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Run,
    RunIpython,
    Read,
    Write,
    Edit,
    Browse,
    BrowseInteractive,
    Delegate,
    Think,
    Message,
    ChangeAgentState,
    Finish,
    Null,
}

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        ActionKind::Run,
        ActionKind::RunIpython,
        ActionKind::Read,
        ActionKind::Write,
        ActionKind::Edit,
        ActionKind::Browse,
        ActionKind::BrowseInteractive,
        ActionKind::Delegate,
        ActionKind::Think,
        ActionKind::Message,
        ActionKind::ChangeAgentState,
        ActionKind::Finish,
        ActionKind::Null,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Run => "run",
            ActionKind::RunIpython => "run_ipython",
            ActionKind::Read => "read",
            ActionKind::Write => "write",
            ActionKind::Edit => "edit",
            ActionKind::Browse => "browse",
            ActionKind::BrowseInteractive => "browse_interactive",
            ActionKind::Delegate => "delegate",
            ActionKind::Think => "think",
            ActionKind::Message => "message",
            ActionKind::ChangeAgentState => "change_agent_state",
            ActionKind::Finish => "finish",
            ActionKind::Null => "null",
        }
    }

    /// Extras fields that must be present for this kind.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ActionKind::Run => &["command"],
            ActionKind::RunIpython => &["code"],
            ActionKind::Read => &["path"],
            ActionKind::Write => &["path", "content"],
            ActionKind::Edit => &["path"],
            ActionKind::Browse => &["url"],
            ActionKind::BrowseInteractive => &["browser_actions"],
            ActionKind::Delegate => &["agent"],
            ActionKind::Think => &["thought"],
            ActionKind::Message => &["content"],
            ActionKind::ChangeAgentState => &["agent_state"],
            ActionKind::Finish | ActionKind::Null => &[],
        }
    }

    /// Whether executing this kind produces an observation from the environment.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            ActionKind::Run
                | ActionKind::RunIpython
                | ActionKind::Read
                | ActionKind::Write
                | ActionKind::Edit
                | ActionKind::Browse
                | ActionKind::BrowseInteractive
                | ActionKind::Delegate
                | ActionKind::Think
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownKind {
                category: "action",
                kind: s.to_string(),
            })
    }
}

/// An intent to act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ActionRecord")]
pub struct Action {
    kind: ActionKind,
    source: EventSource,
    extras: Extras,
}

/// Unvalidated wire form; deserialization goes through [`Action::new`].
#[derive(Deserialize)]
struct ActionRecord {
    kind: ActionKind,
    source: EventSource,
    #[serde(default)]
    extras: Extras,
}

impl TryFrom<ActionRecord> for Action {
    type Error = EventError;

    fn try_from(record: ActionRecord) -> Result<Self, Self::Error> {
        Action::new(record.kind, record.source, record.extras)
    }
}

impl Action {
    /// Build a validated action.
    ///
    /// Fails if the source is the environment or a mandated extras field
    /// is missing.
    pub fn new(kind: ActionKind, source: EventSource, extras: Extras) -> Result<Self, EventError> {
        if source == EventSource::Environment {
            return Err(EventError::InvalidSource {
                category: "action",
                source_name: source.to_string(),
            });
        }
        require_fields("action", kind.as_str(), kind.required_fields(), &extras)?;
        Ok(Action {
            kind,
            source,
            extras,
        })
    }

    /// Build an action from an untyped kind string.
    pub fn parse(kind: &str, source: EventSource, extras: Extras) -> Result<Self, EventError> {
        Action::new(kind.parse()?, source, extras)
    }

    // Fields are known to be present for the helpers below.
    fn agent(kind: ActionKind, extras: Value) -> Self {
        let extras = match extras {
            Value::Object(map) => map,
            _ => Extras::new(),
        };
        Action {
            kind,
            source: EventSource::Agent,
            extras,
        }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Action::agent(ActionKind::Run, json!({ "command": command.into() }))
    }

    pub fn run_ipython(code: impl Into<String>) -> Self {
        Action::agent(ActionKind::RunIpython, json!({ "code": code.into() }))
    }

    pub fn read(path: impl Into<String>) -> Self {
        Action::agent(ActionKind::Read, json!({ "path": path.into() }))
    }

    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Action::agent(
            ActionKind::Write,
            json!({ "path": path.into(), "content": content.into() }),
        )
    }

    pub fn browse(url: impl Into<String>) -> Self {
        Action::agent(ActionKind::Browse, json!({ "url": url.into() }))
    }

    pub fn delegate(agent: impl Into<String>, task: impl Into<String>) -> Self {
        Action::agent(
            ActionKind::Delegate,
            json!({ "agent": agent.into(), "inputs": { "task": task.into() } }),
        )
    }

    pub fn think(thought: impl Into<String>) -> Self {
        Action::agent(ActionKind::Think, json!({ "thought": thought.into() }))
    }

    /// An agent message. `wait_for_response` asks the user for input.
    pub fn agent_message(content: impl Into<String>, wait_for_response: bool) -> Self {
        Action::agent(
            ActionKind::Message,
            json!({ "content": content.into(), "wait_for_response": wait_for_response }),
        )
    }

    pub fn user_message(content: impl Into<String>) -> Self {
        let mut action = Action::agent(ActionKind::Message, json!({ "content": content.into() }));
        action.source = EventSource::User;
        action
    }

    pub fn change_agent_state(state: AgentState) -> Self {
        Action::agent(
            ActionKind::ChangeAgentState,
            json!({ "agent_state": state.as_str() }),
        )
    }

    pub fn finish(outputs: Value) -> Self {
        Action::agent(ActionKind::Finish, json!({ "outputs": outputs }))
    }

    pub fn null() -> Self {
        Action::agent(ActionKind::Null, json!({}))
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        extra_str(&self.extras, field)
    }

    pub fn wait_for_response(&self) -> bool {
        self.kind == ActionKind::Message
            && self
                .extras
                .get("wait_for_response")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// One-line human readable description.
    pub fn message(&self) -> String {
        let field = |name: &str| self.get_str(name).unwrap_or_default().to_string();
        match self.kind {
            ActionKind::Run => format!("Running command: {}", field("command")),
            ActionKind::RunIpython => format!("Running Python code: {}", field("code")),
            ActionKind::Read => format!("Reading file: {}", field("path")),
            ActionKind::Write => format!("Writing file: {}", field("path")),
            ActionKind::Edit => format!("Editing file: {}", field("path")),
            ActionKind::Browse => format!("Browsing URL: {}", field("url")),
            ActionKind::BrowseInteractive => "Interacting with the browser".to_string(),
            ActionKind::Delegate => format!("Delegating to agent: {}", field("agent")),
            ActionKind::Think => field("thought"),
            ActionKind::Message => field("content"),
            ActionKind::ChangeAgentState => format!("Agent state -> {}", field("agent_state")),
            ActionKind::Finish => "All done".to_string(),
            ActionKind::Null => String::new(),
        }
    }
}
