//! Planloop library: event stream, agent state, plans and the planning loop.
//!
//! `main.rs` drives the CLI on top of these modules; integration tests in
//! `tests/` use them directly.

pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod interrupt;
pub mod output;
pub mod plan;
pub mod planner;
pub mod project;
pub mod report;
pub mod run_loop;
pub mod session;
pub mod state;
pub mod stream;

pub use error::{EventError, ExecutorError, LoopError, PlanError, PlannerError, StateError, StreamError};
pub use event::{Action, ActionKind, Event, EventId, EventSource, Observation, ObservationKind};
pub use run_loop::{LoopConfig, Outcome, PlanningLoop};
pub use session::{LoopControl, Session};
pub use state::AgentState;
pub use stream::EventStream;
