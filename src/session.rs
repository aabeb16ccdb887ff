//! Session context: one event stream, one agent state, one control handle.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::event::{Action, Event};
use crate::state::{AgentState, AgentStateMachine};
use crate::stream::{EventStream, SqliteLog};

/// Generate a unique session ID: `sess-{8 hex chars}`.
/// Uses a hash of the current time and process ID.
pub fn generate_session_id() -> String {
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    let hash = hasher.finish();
    format!("sess-{:08x}", hash as u32)
}

/// Operator handle for a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LoopControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    stream: EventStream,
}

impl LoopControl {
    fn new(stream: EventStream) -> Self {
        let (paused, _) = watch::channel(false);
        LoopControl {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
            stream,
        }
    }

    /// Stop the session. Outstanding work is cancelled.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the loop to pause before its next action.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_pause_requested(&self) -> bool {
        *self.paused.borrow()
    }

    /// Answer a question the agent asked, as a user message.
    pub fn reply(&self, text: impl Into<String>) -> Result<Event, StreamError> {
        self.stream.append(Action::user_message(text))
    }

    /// Resolves once [`LoopControl::stop`] has been called.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Wait while paused. Returns `false` if stopped in the meantime.
    pub async fn wait_resumed(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.is_stopped() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One task session. Sessions share nothing with each other.
#[derive(Debug)]
pub struct Session {
    id: String,
    stream: EventStream,
    state: AgentStateMachine,
    control: LoopControl,
}

impl Session {
    pub fn new(id: impl Into<String>, stream: EventStream) -> Self {
        Session {
            id: id.into(),
            control: LoopControl::new(stream.clone()),
            stream,
            state: AgentStateMachine::new(),
        }
    }

    pub fn in_memory() -> Self {
        Session::new(generate_session_id(), EventStream::in_memory())
    }

    /// Start a new session persisted in the SQLite database at `path`.
    pub fn create_sqlite(path: &Path, request: &str) -> Result<Self, StreamError> {
        let id = generate_session_id();
        let log = SqliteLog::create(path, &id, request)?;
        Ok(Session::new(id, EventStream::new(Box::new(log))?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    pub fn state(&self) -> AgentState {
        self.state.current()
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    pub(crate) fn state_machine(&mut self) -> &mut AgentStateMachine {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn session_ids_have_expected_shape() {
        let id = generate_session_id();
        assert!(id.starts_with("sess-"));
        assert_eq!(id.len(), 13);
    }

    #[test]
    fn new_session_starts_in_init() {
        let session = Session::in_memory();
        assert_eq!(session.state(), AgentState::Init);
        assert!(session.stream().is_empty().unwrap());
    }

    #[test]
    fn reply_appends_user_message() {
        let session = Session::in_memory();
        let event = session.control().reply("Berlin").unwrap();
        let action = event.as_action().unwrap();
        assert_eq!(action.message(), "Berlin");
    }

    #[tokio::test]
    async fn wait_resumed_returns_after_resume() {
        let control = Session::in_memory().control();
        control.pause();
        let resumer = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resumer.resume();
        });
        assert!(control.wait_resumed().await);
    }

    #[tokio::test]
    async fn stop_while_paused_ends_wait() {
        let control = Session::in_memory().control();
        control.pause();
        let stopper = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });
        assert!(!control.wait_resumed().await);
        assert!(control.is_stopped());
    }
}
