//! In-process event log.

use chrono::Utc;

use super::EventLog;
use crate::error::StreamError;
use crate::event::{Event, EventId, EventPayload};

/// Events kept in a `Vec`, indexed by id.
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: Vec<Event>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog::default()
    }
}

impl EventLog for MemoryLog {
    fn append(&mut self, payload: EventPayload) -> Result<Event, StreamError> {
        let id = EventId(self.events.len() as u64);
        let event = Event::stored(id, Utc::now(), payload);
        self.events.push(event.clone());
        Ok(event)
    }

    fn read_from(&self, from: EventId, limit: usize) -> Result<Vec<Event>, StreamError> {
        let start = (from.0 as usize).min(self.events.len());
        Ok(self.events[start..].iter().take(limit).cloned().collect())
    }

    fn get(&self, id: EventId) -> Result<Option<Event>, StreamError> {
        Ok(self.events.get(id.0 as usize).cloned())
    }

    fn len(&self) -> Result<u64, StreamError> {
        Ok(self.events.len() as u64)
    }
}
