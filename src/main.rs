//! Planloop: plan a request, then execute it step by step.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use planloop::config::{Config, StreamTarget};
use planloop::event::{Event, EventId, ObservationKind};
use planloop::executor::ShellExecutor;
use planloop::output::{formatter, logger};
use planloop::plan::PlanSnapshot;
use planloop::planner::{FallbackPlanner, StaticPlanner};
use planloop::report::ReportSink;
use planloop::run_loop::{Outcome, PlanningLoop};
use planloop::session::{LoopControl, Session};
use planloop::state::replay_state;
use planloop::stream::{EventStream, SqliteLog};
use planloop::{cli, interrupt, project};

fn main() -> ExitCode {
    match run() {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = cli::Args::parse_args();

    match args.command {
        Some(cli::Command::Init) => {
            project::init()?;
            Ok(ExitCode::SUCCESS)
        }
        Some(cli::Command::Run {
            request,
            steps,
            goal,
            max_retries,
            timeout,
            memory,
        }) => {
            let project = project::discover()?;
            let config = Config::from_run_args(project, max_retries, timeout, memory)?;

            let log_path = logger::init()?;
            print!("Log: ");
            formatter::hyperlink(&log_path.to_string_lossy());

            interrupt::register_signal_handler().context("Failed to register signal handler")?;

            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            let result = runtime.block_on(run_session(config, request, steps, goal));
            // A pending terminal read must not keep the process alive.
            runtime.shutdown_background();
            result
        }
        Some(cli::Command::Events {
            session,
            from,
            json,
        }) => {
            let (_, stream) = open_stored(session)?;
            for event in stream.read(EventId(from)) {
                let event = event.context("Failed to read event")?;
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    formatter::print_event(&event);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(cli::Command::Plan { session, json }) => {
            let (id, stream) = open_stored(session)?;
            let events = collect(&stream)?;
            let Some(snapshot) = latest_plan(&events)? else {
                bail!("Session {id} has no plan yet");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                formatter::print_plan(&snapshot);
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(cli::Command::State { session }) => {
            let (id, stream) = open_stored(session)?;
            let events = collect(&stream)?;
            formatter::print_state(&id, replay_state(&events));
            Ok(ExitCode::SUCCESS)
        }
        Some(cli::Command::Sessions) => {
            let project = project::discover()?;
            let sessions =
                SqliteLog::sessions(&project.events_db()).context("Failed to list sessions")?;
            formatter::print_sessions(&sessions);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            // Bare `planloop` with no subcommand prints help
            use clap::Parser;
            cli::Args::parse_from(["planloop", "--help"]);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_session(
    config: Config,
    request: String,
    steps: Vec<String>,
    goal: Option<String>,
) -> Result<ExitCode> {
    let mut session = match &config.stream {
        StreamTarget::Memory => Session::in_memory(),
        StreamTarget::Sqlite(path) => {
            Session::create_sqlite(path, &request).context("Failed to open event database")?
        }
    };
    println!("Session {}", session.id());

    let mut planner = StaticPlanner::new(steps);
    if let Some(goal) = goal {
        planner = planner.with_goal(goal);
    }

    let reports = ReportSink::new();
    let mut subscriber = reports.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(report) = subscriber.next().await {
            formatter::print_report(&report);
        }
    });
    let watcher = interrupt::stop_on_interrupt(session.control());
    let questions = tokio::spawn(answer_questions(session.stream().clone(), session.control()));

    let mut planning_loop = PlanningLoop::new(
        config.loop_config(),
        Arc::new(ShellExecutor::new(&config.project_root)),
        Arc::new(FallbackPlanner::new(planner)),
        reports,
    );
    let result = planning_loop.run(&mut session, &request).await;

    watcher.abort();
    questions.abort();
    drop(planning_loop);
    printer.await.ok();

    match result.context("Session failed")? {
        Outcome::Finished { .. } => Ok(ExitCode::SUCCESS),
        Outcome::Blocked { step } => {
            formatter::print_blocked(step);
            Ok(ExitCode::from(2))
        }
        Outcome::Stopped => {
            formatter::print_stopped();
            Ok(ExitCode::from(130))
        }
    }
}

/// Relay questions the agent asks to the terminal and send back the answers.
async fn answer_questions(stream: EventStream, control: LoopControl) {
    let mut from = EventId(0);
    loop {
        let asked = stream
            .wait_for(from, |event| {
                event.as_action().is_some_and(|a| a.wait_for_response())
            })
            .await;
        let Ok(asked) = asked else {
            return;
        };
        from = asked.id().next();
        if let Some(action) = asked.as_action() {
            println!("? {}", action.message());
        }

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;
        match line {
            Ok(Ok(text)) => {
                if control.reply(text.trim()).is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}

/// Open a stored session, the latest one unless `session` names another.
fn open_stored(session: Option<String>) -> Result<(String, EventStream)> {
    let project = project::discover()?;
    let db = project.events_db();
    let id = match session {
        Some(id) => id,
        None => latest_session_id(&db)?,
    };
    let log = SqliteLog::open(&db, &id).with_context(|| format!("Failed to open session {id}"))?;
    let stream = EventStream::new(Box::new(log)).context("Failed to open event stream")?;
    Ok((id, stream))
}

fn latest_session_id(db: &Path) -> Result<String> {
    match SqliteLog::latest_session(db).context("Failed to list sessions")? {
        Some(info) => Ok(info.id),
        None => bail!("No sessions recorded yet. Run 'planloop run <REQUEST>' first."),
    }
}

fn collect(stream: &EventStream) -> Result<Vec<Event>> {
    stream
        .read(EventId(0))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read events")
}

fn latest_plan(events: &[Event]) -> Result<Option<PlanSnapshot>> {
    let Some(obs) = events
        .iter()
        .rev()
        .filter_map(Event::as_observation)
        .find(|obs| obs.kind() == ObservationKind::PlanStatus)
    else {
        return Ok(None);
    };
    let value = obs
        .extras()
        .get("plan")
        .cloned()
        .context("Stored plan status has no plan")?;
    let snapshot = serde_json::from_value(value).context("Stored plan snapshot is malformed")?;
    Ok(Some(snapshot))
}
