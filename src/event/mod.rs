//! Typed event model exchanged between the agent and its environment.
//!
//! Events are either [`Action`]s (an intent to act, produced by the agent or
//! the user) or [`Observation`]s (the result of an action, or an unprompted
//! notification). Drafts are built with validating constructors; the stored
//! [`Event`] is only ever produced by the event stream, which assigns its id
//! and timestamp. Nothing exposes mutation once an event is stored.

mod action;
mod observation;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;

pub use action::{Action, ActionKind};
pub use observation::{Observation, ObservationKind};

/// Kind-specific payload: a mapping from field name to value.
pub type Extras = serde_json::Map<String, serde_json::Value>;

/// Position of an event within one stream. Dense and strictly increasing,
/// starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Agent,
    User,
    Environment,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Agent => "agent",
            EventSource::User => "user",
            EventSource::Environment => "environment",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(EventSource::Agent),
            "user" => Ok(EventSource::User),
            "environment" => Ok(EventSource::Environment),
            other => Err(EventError::UnknownSource(other.to_string())),
        }
    }
}

/// Discriminant of a stored event, used for identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Action(ActionKind),
    Observation(ObservationKind),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Action(kind) => write!(f, "action:{kind}"),
            EventKind::Observation(kind) => write!(f, "observation:{kind}"),
        }
    }
}

/// Either side of the protocol, before or after being stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Action(action) => EventKind::Action(action.kind()),
            EventPayload::Observation(obs) => EventKind::Observation(obs.kind()),
        }
    }

    pub fn source(&self) -> EventSource {
        match self {
            EventPayload::Action(action) => action.source(),
            EventPayload::Observation(obs) => obs.source(),
        }
    }

    pub fn extras(&self) -> &Extras {
        match self {
            EventPayload::Action(action) => action.extras(),
            EventPayload::Observation(obs) => obs.extras(),
        }
    }

    pub fn cause(&self) -> Option<EventId> {
        match self {
            EventPayload::Action(_) => None,
            EventPayload::Observation(obs) => obs.cause(),
        }
    }
}

impl From<Action> for EventPayload {
    fn from(action: Action) -> Self {
        EventPayload::Action(action)
    }
}

impl From<Observation> for EventPayload {
    fn from(obs: Observation) -> Self {
        EventPayload::Observation(obs)
    }
}

/// An event that has been appended to a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    payload: EventPayload,
}

impl Event {
    /// Only stream backends create stored events.
    pub(crate) fn stored(id: EventId, timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Event {
            id,
            timestamp,
            payload,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> EventSource {
        self.payload.source()
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn extras(&self) -> &Extras {
        self.payload.extras()
    }

    pub fn cause(&self) -> Option<EventId> {
        self.payload.cause()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(obs) => Some(obs),
            EventPayload::Action(_) => None,
        }
    }
}

// Identity is (id, kind): two events with the same id are never distinct.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind() == other.kind()
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.kind().hash(state);
    }
}

/// Read a string field from extras.
pub(crate) fn extra_str<'a>(extras: &'a Extras, field: &str) -> Option<&'a str> {
    extras.get(field).and_then(|v| v.as_str())
}

/// Check that every mandated field is present and non-null.
pub(crate) fn require_fields(
    category: &'static str,
    kind: &str,
    required: &[&'static str],
    extras: &Extras,
) -> Result<(), EventError> {
    for &field in required {
        match extras.get(field) {
            Some(value) if !value.is_null() => {}
            _ => {
                return Err(EventError::MissingField {
                    category,
                    kind: kind.to_string(),
                    field,
                })
            }
        }
    }
    Ok(())
}
