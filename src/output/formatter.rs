//! Terminal output formatting with ANSI colors.

use colored::Colorize;

use crate::event::{Event, EventPayload, ObservationKind};
use crate::plan::PlanSnapshot;
use crate::report::{Report, ReportKind};
use crate::state::AgentState;
use crate::stream::SessionInfo;

/// Longest observation content shown inline.
const CONTENT_PREVIEW: usize = 120;

/// Print a report from the planning loop.
pub fn print_report(report: &Report) {
    match report.kind {
        ReportKind::Planning => {
            println!("{}", report.content.cyan());
        }
        ReportKind::Error => {
            let label = match report.step {
                Some(step) => format!("✗ step {step}"),
                None => "✗".to_string(),
            };
            println!("{} {}", label.red(), report.content.red());
        }
        ReportKind::FinalAnswer => {
            println!();
            println!("{}", "✓ Done".green());
            println!("{}", report.content);
        }
    }
}

/// One line describing a stored event.
pub fn format_event(event: &Event) -> String {
    let id = format!("{:>4}", event.id().0);
    let source = format!("{:<11}", event.source().as_str());
    match event.payload() {
        EventPayload::Action(action) => {
            format!(
                "{} {} {} {}",
                id.dimmed(),
                source.dimmed(),
                format!("→ {}", action.kind()).cyan(),
                action.message()
            )
        }
        EventPayload::Observation(obs) => {
            let cause = obs
                .cause()
                .map(|c| format!(" ({c})"))
                .unwrap_or_default();
            let head = format!("← {}{cause}", obs.kind());
            let head = if obs.failure().is_some() {
                head.red()
            } else if obs.kind() == ObservationKind::AgentStateChanged {
                head.yellow()
            } else {
                head.green()
            };
            let body = match obs.kind() {
                // Rendered plans are printed by `planloop plan`.
                ObservationKind::PlanStatus => "plan updated".to_string(),
                _ => preview(obs.content()),
            };
            format!("{} {} {} {}", id.dimmed(), source.dimmed(), head, body)
        }
    }
}

pub fn print_event(event: &Event) {
    println!("{}", format_event(event));
}

pub fn print_plan(snapshot: &PlanSnapshot) {
    println!("{}", snapshot.render());
}

pub fn print_state(session_id: &str, state: AgentState) {
    let label = match state {
        AgentState::Finished => state.as_str().green(),
        AgentState::Error | AgentState::Stopped => state.as_str().red(),
        _ => state.as_str().yellow(),
    };
    println!("{session_id}: {label}");
}

pub fn print_sessions(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No sessions recorded.");
        return;
    }
    for info in sessions {
        println!(
            "{}  {}  {:>4} events  {}",
            info.id.bold(),
            info.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            info.events,
            preview(&info.request)
        );
    }
}

pub fn print_blocked(step: usize) {
    eprintln!(
        "{}",
        format!("Session blocked: step {step} failed after exhausting its retries").red()
    );
}

pub fn print_stopped() {
    eprintln!("{}", "Session stopped.".yellow());
}

/// Print a clickable file hyperlink.
pub fn hyperlink(path: &str) {
    println!("\x1b]8;;file://{}\x1b\\{}\x1b]8;;\x1b\\", path, path);
}

/// First line of `text`, shortened to [`CONTENT_PREVIEW`] characters.
fn preview(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    let mut chars = first.chars();
    let head: String = chars.by_ref().take(CONTENT_PREVIEW).collect();
    let truncated = chars.next().is_some() || text.lines().nth(1).is_some();
    if truncated {
        format!("{head}…")
    } else {
        head
    }
}
