//! Plain-text rendering of plans, used for planning reports and `planloop plan`.

use std::fmt::Write;

use super::{PlanSnapshot, StatusCounts, StepStatus};

/// Marker printed before each step description.
pub fn status_mark(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "[✓]",
        StepStatus::InProgress => "[→]",
        StepStatus::Blocked => "[!]",
        StepStatus::NotStarted => "[ ]",
    }
}

/// Render a plan snapshot as structured text.
pub fn render(snapshot: &PlanSnapshot) -> String {
    let counts = StatusCounts::tally(snapshot.steps.iter().map(|s| s.status));
    let total = snapshot.steps.len();
    let percent = if total > 0 {
        counts.completed as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let header = format!("Plan: {} (ID: {})", snapshot.goal, snapshot.plan_id);
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "{header}");
    let _ = writeln!(out, "{}", "=".repeat(header.chars().count()));
    out.push('\n');
    let _ = writeln!(
        out,
        "Progress: {}/{} steps completed ({:.1}%)",
        counts.completed, total, percent
    );
    let _ = writeln!(
        out,
        "Status: {} completed, {} in progress, {} blocked, {} not started",
        counts.completed, counts.in_progress, counts.blocked, counts.not_started
    );
    out.push('\n');
    out.push_str("Steps:\n");

    for step in &snapshot.steps {
        let _ = writeln!(
            out,
            "{}. {} {}",
            step.index,
            status_mark(step.status),
            step.description
        );
        if !step.notes.is_empty() {
            let _ = writeln!(out, "   Notes: {}", step.notes);
        }
        if let Some(result) = step.result.as_deref().filter(|r| !r.is_empty()) {
            let _ = writeln!(out, "   Result: {result}");
        }
    }

    out
}
