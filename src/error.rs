//! Error taxonomy.
//!
//! Plan, stream, and state errors are caller-facing and typed so the loop can
//! tell recoverable step failures apart from programming defects and fatal
//! environment failures. Application code (CLI, config) wraps these in
//! `anyhow` at the edges.

use thiserror::Error;

use crate::event::EventId;
use crate::plan::StepStatus;
use crate::state::AgentState;

/// Errors raised by the planning tool and plan mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("step index {index} out of range (plan has {len} steps)")]
    Index { index: usize, len: usize },

    #[error("invalid status transition for step {index}: '{from}' -> '{to}'")]
    InvalidTransition {
        index: usize,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("cannot start step {index}: step {active} is already in progress")]
    Conflict { index: usize, active: usize },

    #[error("step {index}: a result may only be attached when completing a step")]
    UnexpectedResult { index: usize },

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("plan '{0}' already exists")]
    DuplicatePlan(String),

    #[error("plan '{0}' still has incomplete steps")]
    Incomplete(String),
}

/// Errors raised while constructing events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("unknown {category} kind '{kind}'")]
    UnknownKind {
        category: &'static str,
        kind: String,
    },

    #[error("{category} '{kind}' requires extras field '{field}'")]
    MissingField {
        category: &'static str,
        kind: String,
        field: &'static str,
    },

    #[error("{category} cannot originate from source '{source_name}'")]
    InvalidSource {
        category: &'static str,
        source_name: String,
    },

    #[error("unknown event source '{0}'")]
    UnknownSource(String),
}

/// Errors raised by the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("event stream unavailable: {0}")]
    Unavailable(String),

    #[error("observation references unknown cause {0}")]
    UnknownCause(EventId),

    #[error("observation cause {0} is not an action")]
    CauseNotAction(EventId),

    #[error("observation '{observation}' cannot answer action '{action}' ({cause})")]
    MismatchedCause {
        cause: EventId,
        action: String,
        observation: String,
    },

    #[error("stored event {id} is corrupt: {reason}")]
    Corrupt { id: EventId, reason: String },
}

impl From<rusqlite::Error> for StreamError {
    fn from(err: rusqlite::Error) -> Self {
        StreamError::Unavailable(err.to_string())
    }
}

/// Errors raised by the agent state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid agent state transition: '{from}' -> '{to}'")]
    InvalidTransition { from: AgentState, to: AgentState },

    #[error("unknown agent state '{0}'")]
    Unknown(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Errors returned by an executor for a dispatched action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("action '{0}' is not supported by this executor")]
    Unsupported(String),

    #[error("action failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Event(#[from] EventError),
}

/// A planner could not produce a plan, actions, or a summary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PlannerError(pub String);

/// Errors surfaced by the planning loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("invalid agent state: {0}")]
    State(String),

    #[error("event stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("stream rejected event: {0}")]
    Stream(StreamError),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("no observation within {secs}s for action {action}")]
    Timeout { action: EventId, secs: u64 },

    #[error("planner failed: {0}")]
    Planner(String),
}

impl From<StreamError> for LoopError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Unavailable(msg) => LoopError::StreamUnavailable(msg),
            other => LoopError::Stream(other),
        }
    }
}

impl From<PlannerError> for LoopError {
    fn from(err: PlannerError) -> Self {
        LoopError::Planner(err.0)
    }
}

impl From<StateError> for LoopError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Stream(stream) => stream.into(),
            other => LoopError::State(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_stream_maps_to_fatal_loop_error() {
        let err: LoopError = StreamError::Unavailable("disk gone".into()).into();
        assert_eq!(err, LoopError::StreamUnavailable("disk gone".into()));
    }

    #[test]
    fn state_stream_failure_unwraps_to_stream_error() {
        let err: LoopError = StateError::Stream(StreamError::Unavailable("x".into())).into();
        assert!(matches!(err, LoopError::StreamUnavailable(_)));
    }

    #[test]
    fn transition_error_message_names_both_statuses() {
        let err = PlanError::InvalidTransition {
            index: 2,
            from: StepStatus::Completed,
            to: StepStatus::NotStarted,
        };
        let msg = err.to_string();
        assert!(msg.contains("'completed' -> 'not_started'"), "{msg}");
    }
}
