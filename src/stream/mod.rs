//! Append-only event stream for one session.
//!
//! [`EventLog`] is the storage seam (memory or SQLite); [`EventStream`] is
//! the shared handle everything else holds. Appends are serialized by the
//! stream's mutex, so ids are dense and strictly increasing from 0.
//! Observations that name a cause are checked against the log before they
//! are stored, which keeps every observation behind its action.

mod memory;
mod sqlite;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{trace, warn};

use crate::error::StreamError;
use crate::event::{ActionKind, Event, EventId, EventPayload, EventSource, Observation};

pub use memory::MemoryLog;
pub use sqlite::{SessionInfo, SqliteLog};

/// Events fetched per backend read.
const PAGE_SIZE: usize = 64;

/// Storage backend for one session's events.
pub trait EventLog: Send {
    /// Store `payload` under the next id.
    fn append(&mut self, payload: EventPayload) -> Result<Event, StreamError>;

    /// Up to `limit` events starting at `from`, in id order.
    fn read_from(&self, from: EventId, limit: usize) -> Result<Vec<Event>, StreamError>;

    fn get(&self, id: EventId) -> Result<Option<Event>, StreamError>;

    /// Number of stored events, which is also the next id.
    fn len(&self) -> Result<u64, StreamError>;

    fn is_empty(&self) -> Result<bool, StreamError> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Clone, Default)]
struct Head {
    len: u64,
    closed: Option<String>,
}

struct Shared {
    log: Mutex<Box<dyn EventLog>>,
    head: watch::Sender<Head>,
}

/// Cloneable handle to a session's event log.
#[derive(Clone)]
pub struct EventStream {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = self.shared.head.borrow();
        f.debug_struct("EventStream")
            .field("len", &head.len)
            .field("closed", &head.closed)
            .finish()
    }
}

impl EventStream {
    pub fn new(log: Box<dyn EventLog>) -> Result<Self, StreamError> {
        let len = log.len()?;
        let (head, _) = watch::channel(Head { len, closed: None });
        Ok(EventStream {
            shared: Arc::new(Shared {
                log: Mutex::new(log),
                head,
            }),
        })
    }

    pub fn in_memory() -> Self {
        let (head, _) = watch::channel(Head::default());
        EventStream {
            shared: Arc::new(Shared {
                log: Mutex::new(Box::new(MemoryLog::new())),
                head,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn EventLog>>, StreamError> {
        self.shared
            .log
            .lock()
            .map_err(|_| StreamError::Unavailable("event log lock poisoned".into()))
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        match &self.shared.head.borrow().closed {
            Some(reason) => Err(StreamError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    /// Append a draft, assigning it the next id. Returns the stored event.
    pub fn append(&self, draft: impl Into<EventPayload>) -> Result<Event, StreamError> {
        let payload = draft.into();
        let event = {
            let mut log = self.lock()?;
            self.ensure_open()?;
            if let EventPayload::Observation(obs) = &payload {
                if let Some(cause) = obs.cause() {
                    check_cause(&**log, cause, obs)?;
                }
            }
            log.append(payload)?
        };
        let len = event.id().0 + 1;
        self.shared.head.send_modify(|head| head.len = len);
        trace!(event_id = event.id().0, kind = %event.kind(), "event appended");
        Ok(event)
    }

    pub fn get(&self, id: EventId) -> Result<Option<Event>, StreamError> {
        self.lock()?.get(id)
    }

    fn read_page(&self, from: EventId, limit: usize) -> Result<Vec<Event>, StreamError> {
        self.lock()?.read_from(from, limit)
    }

    pub fn len(&self) -> Result<u64, StreamError> {
        self.lock()?.len()
    }

    pub fn is_empty(&self) -> Result<bool, StreamError> {
        Ok(self.len()? == 0)
    }

    /// Lazy sequence of events from `from` up to the current end.
    pub fn read(&self, from: EventId) -> EventCursor {
        EventCursor::new(self.clone(), from)
    }

    /// Mark the stream unavailable. Later appends and waits fail.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "event stream closed");
        self.shared.head.send_modify(|head| head.closed = Some(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.head.borrow().closed.is_some()
    }

    /// Suspend until an event at or after `from` satisfies `matches`.
    pub async fn wait_for<F>(&self, from: EventId, mut matches: F) -> Result<Event, StreamError>
    where
        F: FnMut(&Event) -> bool,
    {
        let mut rx = self.shared.head.subscribe();
        let mut next = from;
        loop {
            let head = rx.borrow_and_update().clone();
            while next.0 < head.len {
                let page = self.read_page(next, PAGE_SIZE)?;
                let Some(last) = page.last() else {
                    break;
                };
                next = last.id().next();
                if let Some(found) = page.into_iter().find(|e| matches(e)) {
                    return Ok(found);
                }
            }
            if let Some(reason) = head.closed {
                return Err(StreamError::Unavailable(reason));
            }
            if rx.changed().await.is_err() {
                return Err(StreamError::Unavailable("event stream dropped".into()));
            }
        }
    }

    /// Suspend until an observation caused by `cause` is appended.
    pub async fn wait_for_observation(&self, cause: EventId) -> Result<Event, StreamError> {
        self.wait_for(cause.next(), |event| event.cause() == Some(cause))
            .await
    }

    /// Suspend until the user sends a message at or after `from`.
    pub async fn wait_for_user_message(&self, from: EventId) -> Result<Event, StreamError> {
        self.wait_for(from, |event| {
            event.source() == EventSource::User
                && event
                    .as_action()
                    .is_some_and(|a| a.kind() == ActionKind::Message)
        })
        .await
    }
}

fn check_cause(log: &dyn EventLog, cause: EventId, obs: &Observation) -> Result<(), StreamError> {
    let event = log.get(cause)?.ok_or(StreamError::UnknownCause(cause))?;
    let action = event
        .as_action()
        .ok_or(StreamError::CauseNotAction(cause))?;
    if !obs.kind().answers(action.kind()) {
        return Err(StreamError::MismatchedCause {
            cause,
            action: action.kind().to_string(),
            observation: obs.kind().to_string(),
        });
    }
    Ok(())
}

/// Restartable, paging iterator over a stream.
///
/// The end is fixed when iteration first starts; [`EventCursor::restart`]
/// rewinds and picks up events appended since.
pub struct EventCursor {
    stream: EventStream,
    start: EventId,
    next: EventId,
    end: Option<u64>,
    buffer: VecDeque<Event>,
    failed: bool,
}

impl EventCursor {
    fn new(stream: EventStream, from: EventId) -> Self {
        EventCursor {
            stream,
            start: from,
            next: from,
            end: None,
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    pub fn restart(&mut self) {
        self.next = self.start;
        self.end = None;
        self.buffer.clear();
        self.failed = false;
    }

    fn fill(&mut self) -> Result<(), StreamError> {
        let end = match self.end {
            Some(end) => end,
            None => {
                let end = self.stream.len()?;
                self.end = Some(end);
                end
            }
        };
        if self.next.0 >= end {
            return Ok(());
        }
        let limit = PAGE_SIZE.min((end - self.next.0) as usize);
        let page = self.stream.read_page(self.next, limit)?;
        match page.last() {
            Some(last) => self.next = last.id().next(),
            None => self.next = EventId(end),
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EventCursor {
    type Item = Result<Event, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.failed {
            if let Err(err) = self.fill() {
                self.failed = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use std::time::Duration;

    #[test]
    fn ids_are_dense_from_zero() {
        let stream = EventStream::in_memory();
        for i in 0..5 {
            let event = stream.append(Action::run(format!("echo {i}"))).unwrap();
            assert_eq!(event.id(), EventId(i));
        }
        assert_eq!(stream.len().unwrap(), 5);
    }

    #[test]
    fn observation_cannot_precede_its_action() {
        let stream = EventStream::in_memory();
        let err = stream
            .append(Observation::run("ls", 0, "").with_cause(EventId(0)))
            .unwrap_err();
        assert_eq!(err, StreamError::UnknownCause(EventId(0)));
        assert!(stream.is_empty().unwrap());
    }

    #[test]
    fn cause_must_be_an_action_of_matching_kind() {
        let stream = EventStream::in_memory();
        let obs = stream.append(Observation::think("hm")).unwrap();
        let err = stream
            .append(Observation::think("again").with_cause(obs.id()))
            .unwrap_err();
        assert_eq!(err, StreamError::CauseNotAction(obs.id()));

        let run = stream.append(Action::run("ls")).unwrap();
        let err = stream
            .append(Observation::read("a.txt", "").with_cause(run.id()))
            .unwrap_err();
        assert!(matches!(err, StreamError::MismatchedCause { .. }));

        stream
            .append(Observation::error("boom").with_cause(run.id()))
            .unwrap();
    }

    #[test]
    fn cursor_is_lazy_and_restartable() {
        let stream = EventStream::in_memory();
        for i in 0..3 {
            stream.append(Action::think(format!("t{i}"))).unwrap();
        }
        let mut cursor = stream.read(EventId(1));
        let ids: Vec<u64> = cursor.by_ref().map(|e| e.unwrap().id().0).collect();
        assert_eq!(ids, vec![1, 2]);

        stream.append(Action::think("t3")).unwrap();
        assert!(cursor.next().is_none());

        cursor.restart();
        let ids: Vec<u64> = cursor.map(|e| e.unwrap().id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn closed_stream_rejects_appends() {
        let stream = EventStream::in_memory();
        stream.append(Action::null()).unwrap();
        stream.close("disk full");
        assert_eq!(
            stream.append(Action::null()).unwrap_err(),
            StreamError::Unavailable("disk full".into())
        );
        assert_eq!(stream.read(EventId(0)).count(), 1);
    }

    #[tokio::test]
    async fn wait_for_observation_wakes_on_append() {
        let stream = EventStream::in_memory();
        let action = stream.append(Action::run("ls")).unwrap();

        let writer = stream.clone();
        let id = action.id();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(Observation::think("unrelated")).unwrap();
            writer
                .append(Observation::run("ls", 0, "a").with_cause(id))
                .unwrap();
        });

        let obs = stream.wait_for_observation(id).await.unwrap();
        assert_eq!(obs.cause(), Some(id));
        assert_eq!(obs.id(), EventId(2));
    }

    #[tokio::test]
    async fn wait_for_observation_finds_existing_event() {
        let stream = EventStream::in_memory();
        let action = stream.append(Action::run("ls")).unwrap();
        stream
            .append(Observation::run("ls", 0, "").with_cause(action.id()))
            .unwrap();
        let obs = stream.wait_for_observation(action.id()).await.unwrap();
        assert_eq!(obs.id(), EventId(1));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let stream = EventStream::in_memory();
        let action = stream.append(Action::run("sleep 10")).unwrap();
        let closer = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close("gone");
        });
        let err = stream.wait_for_observation(action.id()).await.unwrap_err();
        assert_eq!(err, StreamError::Unavailable("gone".into()));
    }
}
