//! Agent execution state and its transition rules.
//!
//! The current state is owned by the session, never a global. Every change
//! goes through [`AgentStateMachine::transition`], which appends an
//! `agent_state_changed` observation before the field moves, so observers
//! can always rebuild the state from the stream with [`replay_state`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{StateError, StreamError};
use crate::event::{Event, Observation};
use crate::stream::EventStream;

/// The agent's execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Init,
    Running,
    AwaitingUserInput,
    Paused,
    Stopped,
    Finished,
    Error,
}

impl AgentState {
    pub const ALL: [AgentState; 7] = [
        AgentState::Init,
        AgentState::Running,
        AgentState::AwaitingUserInput,
        AgentState::Paused,
        AgentState::Stopped,
        AgentState::Finished,
        AgentState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Init => "init",
            AgentState::Running => "running",
            AgentState::AwaitingUserInput => "awaiting_user_input",
            AgentState::Paused => "paused",
            AgentState::Stopped => "stopped",
            AgentState::Finished => "finished",
            AgentState::Error => "error",
        }
    }

    /// No further actions are dispatched once a terminal state is reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Finished | AgentState::Stopped)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StateError::Unknown(s.to_string()))
    }
}

/// Valid agent state transitions:
/// - init -> running
/// - running -> paused, paused -> running
/// - running -> awaiting_user_input -> running
/// - running -> finished
/// - running -> error, error -> running
/// - any state except stopped -> stopped
pub fn can_transition(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;
    matches!(
        (from, to),
        (Init, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, AwaitingUserInput)
            | (AwaitingUserInput, Running)
            | (Running, Finished)
            | (Running, Error)
            | (Error, Running)
    ) || (to == Stopped && from != Stopped)
}

/// Holds the one current state of a session.
#[derive(Debug)]
pub struct AgentStateMachine {
    current: AgentState,
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        AgentStateMachine::new()
    }
}

impl AgentStateMachine {
    pub fn new() -> Self {
        AgentStateMachine {
            current: AgentState::Init,
        }
    }

    pub fn current(&self) -> AgentState {
        self.current
    }

    /// Validate, record the change in the stream, then update the state.
    ///
    /// If the append fails the state is left untouched.
    pub fn transition(&mut self, to: AgentState, stream: &EventStream) -> Result<Event, StateError> {
        let from = self.current;
        if !can_transition(from, to) {
            return Err(StateError::InvalidTransition { from, to });
        }
        let event = stream.append(Observation::agent_state_changed(to, from))?;
        debug!(from = %from, to = %to, event_id = event.id().0, "agent state changed");
        self.current = to;
        Ok(event)
    }

    /// Move to `error` after a fatal failure, bypassing the transition table.
    ///
    /// The change is still appended when the stream accepts it; otherwise
    /// it is only recorded locally and the stream error is returned.
    pub fn force_error(&mut self, stream: &EventStream) -> Result<Option<Event>, StreamError> {
        let from = self.current;
        if from == AgentState::Error {
            return Ok(None);
        }
        self.current = AgentState::Error;
        match stream.append(Observation::agent_state_changed(AgentState::Error, from)) {
            Ok(event) => Ok(Some(event)),
            Err(err) => {
                error!(from = %from, error = %err, "could not record forced error state");
                Err(err)
            }
        }
    }
}

/// Fold `agent_state_changed` observations in stream order.
pub fn replay_state<'a>(events: impl IntoIterator<Item = &'a Event>) -> AgentState {
    events
        .into_iter()
        .filter_map(|event| event.as_observation().and_then(Observation::agent_state))
        .last()
        .unwrap_or(AgentState::Init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, EventId};

    #[test]
    fn documented_transitions_are_allowed() {
        use AgentState::*;
        for (from, to) in [
            (Init, Running),
            (Running, Paused),
            (Paused, Running),
            (Running, AwaitingUserInput),
            (AwaitingUserInput, Running),
            (Running, Finished),
            (Running, Error),
            (Error, Running),
            (Finished, Stopped),
            (Paused, Stopped),
        ] {
            assert!(can_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn terminal_states_do_not_resume() {
        use AgentState::*;
        assert!(!can_transition(Finished, Running));
        assert!(!can_transition(Stopped, Running));
        assert!(!can_transition(Stopped, Stopped));
        assert!(!can_transition(Paused, Finished));
        assert!(!can_transition(Init, Finished));
    }

    #[test]
    fn transition_appends_before_updating() {
        let stream = EventStream::in_memory();
        let mut machine = AgentStateMachine::new();

        let event = machine.transition(AgentState::Running, &stream).unwrap();
        assert_eq!(machine.current(), AgentState::Running);
        let obs = event.as_observation().unwrap();
        assert_eq!(obs.agent_state(), Some(AgentState::Running));
        assert_eq!(obs.get_str("previous"), Some("init"));
        assert_eq!(stream.len().unwrap(), 1);
    }

    #[test]
    fn invalid_transition_leaves_stream_untouched() {
        let stream = EventStream::in_memory();
        let mut machine = AgentStateMachine::new();

        let err = machine.transition(AgentState::Finished, &stream).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: AgentState::Init,
                to: AgentState::Finished
            }
        );
        assert_eq!(machine.current(), AgentState::Init);
        assert_eq!(stream.len().unwrap(), 0);
    }

    #[test]
    fn failed_append_keeps_previous_state() {
        let stream = EventStream::in_memory();
        let mut machine = AgentStateMachine::new();
        stream.close("disk gone");

        assert!(matches!(
            machine.transition(AgentState::Running, &stream),
            Err(StateError::Stream(StreamError::Unavailable(_)))
        ));
        assert_eq!(machine.current(), AgentState::Init);
    }

    #[test]
    fn force_error_records_locally_when_stream_is_gone() {
        let stream = EventStream::in_memory();
        let mut machine = AgentStateMachine::new();
        machine.transition(AgentState::Running, &stream).unwrap();
        stream.close("disk gone");

        assert!(machine.force_error(&stream).is_err());
        assert_eq!(machine.current(), AgentState::Error);
    }

    #[test]
    fn replay_follows_stream_order() {
        let stream = EventStream::in_memory();
        let mut machine = AgentStateMachine::new();
        machine.transition(AgentState::Running, &stream).unwrap();
        stream.append(Action::run("ls")).unwrap();
        machine.transition(AgentState::Paused, &stream).unwrap();
        machine.transition(AgentState::Running, &stream).unwrap();
        machine.transition(AgentState::Finished, &stream).unwrap();

        let events: Vec<Event> = stream.read(EventId(0)).collect::<Result<_, _>>().unwrap();
        assert_eq!(replay_state(&events), AgentState::Finished);
        assert_eq!(replay_state(&events[..3]), AgentState::Paused);
        assert_eq!(replay_state(&events[..0]), AgentState::Init);
    }

    #[test]
    fn parse_unknown_state_fails() {
        assert_eq!(
            "sleeping".parse::<AgentState>(),
            Err(StateError::Unknown("sleeping".into()))
        );
        assert_eq!(
            "awaiting_user_input".parse::<AgentState>(),
            Ok(AgentState::AwaitingUserInput)
        );
    }
}
