//! Typed reports published by the planning loop.
//!
//! Subscribers (the CLI, tests, a UI) each get their own [`ReportStream`];
//! delivery is asynchronous and a slow subscriber may skip reports rather
//! than stall the loop.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::plan::PlanSnapshot;

/// Reports buffered per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Planning,
    Error,
    FinalAnswer,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Planning => "planning",
            ReportKind::Error => "error",
            ReportKind::FinalAnswer => "final_answer",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "type")]
    pub kind: ReportKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSnapshot>,
    pub timestamp: DateTime<Utc>,
}

impl Report {
    fn new(kind: ReportKind, content: String) -> Self {
        Report {
            kind,
            content,
            step: None,
            plan: None,
            timestamp: Utc::now(),
        }
    }

    /// A plan snapshot, rendered as text in `content`.
    pub fn planning(snapshot: PlanSnapshot) -> Self {
        let mut report = Report::new(ReportKind::Planning, snapshot.render());
        report.plan = Some(snapshot);
        report
    }

    pub fn error(step: Option<usize>, message: impl Into<String>) -> Self {
        let mut report = Report::new(ReportKind::Error, message.into());
        report.step = step;
        report
    }

    pub fn final_answer(summary: impl Into<String>) -> Self {
        Report::new(ReportKind::FinalAnswer, summary.into())
    }
}

/// Publishing side, cloneable.
#[derive(Debug, Clone)]
pub struct ReportSink {
    tx: broadcast::Sender<Report>,
}

impl Default for ReportSink {
    fn default() -> Self {
        ReportSink::new()
    }
}

impl ReportSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        ReportSink { tx }
    }

    /// Publish a report. Having no subscribers is not an error.
    pub fn emit(&self, report: Report) {
        let _ = self.tx.send(report);
    }

    pub fn subscribe(&self) -> ReportStream {
        ReportStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscriber's view of the reports published after it subscribed.
#[derive(Debug)]
pub struct ReportStream {
    rx: broadcast::Receiver<Report>,
}

impl ReportStream {
    /// Next report, or `None` once every sink is dropped.
    pub async fn next(&mut self) -> Option<Report> {
        loop {
            match self.rx.recv().await {
                Ok(report) => return Some(report),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "report subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next report if one is already queued.
    pub fn try_next(&mut self) -> Option<Report> {
        loop {
            match self.rx.try_recv() {
                Ok(report) => return Some(report),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "report subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<Report> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}
