//! End-to-end tests for the planning loop with a scripted executor.
//!
//! The executor answers each dispatched action from a queue of canned
//! replies, so every scenario is deterministic and needs no processes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use planloop::event::{ActionKind, Event, EventId, EventSource, Observation, ObservationKind};
use planloop::executor::Executor;
use planloop::plan::StepStatus;
use planloop::planner::StaticPlanner;
use planloop::report::{ReportKind, ReportSink};
use planloop::run_loop::{LoopConfig, Outcome, PlanningLoop};
use planloop::session::Session;
use planloop::state::{replay_state, AgentState};
use planloop::stream::EventStream;
use planloop::{ExecutorError, LoopError};

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Clone)]
enum Reply {
    Ok(&'static str),
    Fail(&'static str),
    Hang,
}

/// Answers actions from a queue; an empty queue answers `Ok("")`.
#[derive(Default)]
struct ScriptedExecutor {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(ScriptedExecutor {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn idle() -> Arc<Self> {
        Arc::new(ScriptedExecutor::default())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, event: &Event) -> Result<Observation, ExecutorError> {
        let action = event.as_action().unwrap();
        let command = action.get_str("command").unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(command.clone());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Ok(""));
        match reply {
            Reply::Ok(output) => Ok(Observation::run(command, 0, output)),
            Reply::Fail(output) => Ok(Observation::run(command, 1, output)),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Closes the stream before answering, as if storage went away.
struct VanishingStorage {
    stream: EventStream,
}

#[async_trait]
impl Executor for VanishingStorage {
    async fn execute(&self, event: &Event) -> Result<Observation, ExecutorError> {
        self.stream.close("disk detached");
        let command = event.as_action().and_then(|a| a.get_str("command")).unwrap_or_default();
        Ok(Observation::run(command, 0, "ok"))
    }
}

fn steps(items: &[&str]) -> Arc<StaticPlanner> {
    Arc::new(StaticPlanner::new(items.iter().map(|s| s.to_string()).collect()))
}

fn config(max_retries: u32, timeout: Duration) -> LoopConfig {
    LoopConfig {
        max_retries,
        action_timeout: timeout,
        ..LoopConfig::default()
    }
}

fn events(stream: &EventStream) -> Vec<Event> {
    stream.read(EventId(0)).collect::<Result<_, _>>().unwrap()
}

fn states(events: &[Event]) -> Vec<AgentState> {
    events
        .iter()
        .filter_map(Event::as_observation)
        .filter_map(Observation::agent_state)
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn completes_every_step_in_order() {
    let exec = ScriptedExecutor::new([Reply::Ok("one"), Reply::Ok("two"), Reply::Ok("three")]);
    let reports = ReportSink::new();
    let mut sub = reports.subscribe();
    let mut session = Session::in_memory();
    let mut lp = PlanningLoop::new(
        LoopConfig::default(),
        exec.clone(),
        steps(&["[RUN] step-a", "[RUN] step-b", "[RUN] step-c"]),
        reports.clone(),
    );

    let outcome = lp.run(&mut session, "build weather app").await.unwrap();

    let Outcome::Finished { summary } = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    assert!(summary.contains("0. [RUN] step-a: one"), "{summary}");
    assert!(summary.contains("2. [RUN] step-c: three"), "{summary}");
    assert_eq!(exec.calls(), vec!["step-a", "step-b", "step-c"]);
    assert_eq!(session.state(), AgentState::Finished);

    let plan = lp.plans().active_plan().unwrap();
    assert!(plan.steps().iter().all(|s| s.status() == StepStatus::Completed));
    assert_eq!(plan.step(1).unwrap().result(), Some("two"));

    let all = events(session.stream());
    // The request is recorded as a user message right after the loop starts.
    assert_eq!(all[1].source(), EventSource::User);
    assert_eq!(all[1].as_action().unwrap().message(), "build weather app");

    // Every observation follows the action it answers.
    for event in &all {
        if let Some(cause) = event.cause() {
            assert!(cause < event.id());
            assert!(all[cause.0 as usize].as_action().is_some());
        }
    }

    let finish = &all[all.len() - 2];
    assert_eq!(finish.as_action().unwrap().kind(), ActionKind::Finish);
    assert_eq!(finish.extras()["outputs"]["summary"], summary.as_str());
    assert_eq!(
        states(&all),
        vec![AgentState::Running, AgentState::Finished]
    );
    assert_eq!(replay_state(&all), AgentState::Finished);

    let reports = sub.drain();
    assert_eq!(reports.first().unwrap().kind, ReportKind::Planning);
    assert_eq!(reports.last().unwrap().kind, ReportKind::FinalAnswer);
    assert!(reports.iter().all(|r| r.kind != ReportKind::Error));
}

#[tokio::test]
async fn failing_step_uses_retry_budget_then_blocks() {
    let exec = ScriptedExecutor::new([
        Reply::Ok("scaffolded"),
        Reply::Fail("no API key"),
        Reply::Fail("no API key"),
        Reply::Fail("no API key"),
    ]);
    let reports = ReportSink::new();
    let mut sub = reports.subscribe();
    let mut session = Session::in_memory();
    let mut lp = PlanningLoop::new(
        config(2, Duration::from_secs(5)),
        exec.clone(),
        steps(&["[RUN] scaffold", "[RUN] fetch-weather", "[RUN] deploy"]),
        reports.clone(),
    );

    let outcome = lp.run(&mut session, "build weather app").await.unwrap();

    assert_eq!(outcome, Outcome::Blocked { step: 1 });
    assert_eq!(session.state(), AgentState::Error);
    assert_eq!(
        exec.calls(),
        vec!["scaffold", "fetch-weather", "fetch-weather", "fetch-weather"]
    );

    let plan = lp.plans().active_plan().unwrap();
    let step = plan.step(1).unwrap();
    assert_eq!(step.status(), StepStatus::Blocked);
    assert_eq!(step.attempts(), 3);
    assert!(step.notes().contains("no API key"), "{}", step.notes());
    assert_eq!(plan.step(2).unwrap().status(), StepStatus::NotStarted);

    let errors: Vec<_> = sub
        .drain()
        .into_iter()
        .filter(|r| r.kind == ReportKind::Error)
        .collect();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|r| r.step == Some(1)));
    assert_eq!(replay_state(&events(session.stream())), AgentState::Error);
}

#[tokio::test]
async fn step_recovers_on_retry() {
    let exec = ScriptedExecutor::new([Reply::Fail("flaky"), Reply::Ok("fine")]);
    let mut session = Session::in_memory();
    let mut lp = PlanningLoop::new(
        LoopConfig::default(),
        exec.clone(),
        steps(&["[RUN] test"]),
        ReportSink::new(),
    );

    let outcome = lp.run(&mut session, "run tests").await.unwrap();

    assert!(matches!(outcome, Outcome::Finished { .. }));
    let step = lp.plans().active_plan().unwrap().step(0).unwrap().clone();
    assert_eq!(step.status(), StepStatus::Completed);
    assert_eq!(step.attempts(), 2);
    assert_eq!(step.result(), Some("fine"));
}

#[tokio::test]
async fn zero_retry_budget_blocks_on_first_failure() {
    let exec = ScriptedExecutor::new([Reply::Fail("boom")]);
    let mut session = Session::in_memory();
    let mut lp = PlanningLoop::new(
        config(0, Duration::from_secs(5)),
        exec.clone(),
        steps(&["[RUN] once"]),
        ReportSink::new(),
    );

    let outcome = lp.run(&mut session, "once").await.unwrap();
    assert_eq!(outcome, Outcome::Blocked { step: 0 });
    assert_eq!(exec.calls().len(), 1);
}

#[tokio::test]
async fn timed_out_action_gets_error_observation() {
    let exec = ScriptedExecutor::new([Reply::Hang]);
    let mut session = Session::in_memory();
    let mut lp = PlanningLoop::new(
        config(0, Duration::from_millis(50)),
        exec,
        steps(&["[RUN] sleep-forever"]),
        ReportSink::new(),
    );

    let outcome = lp.run(&mut session, "wait").await.unwrap();
    assert_eq!(outcome, Outcome::Blocked { step: 0 });

    let all = events(session.stream());
    let action = all
        .iter()
        .find(|e| e.as_action().is_some_and(|a| a.kind() == ActionKind::Run))
        .unwrap();
    let timeout = all
        .iter()
        .filter_map(Event::as_observation)
        .find(|o| o.cause() == Some(action.id()))
        .unwrap();
    assert_eq!(timeout.kind(), ObservationKind::Error);
    assert!(timeout.content().starts_with("timed out after"), "{}", timeout.content());

    let notes = lp.plans().active_plan().unwrap().step(0).unwrap().notes().to_string();
    assert!(notes.contains("no observation within"), "{notes}");
}

#[tokio::test]
async fn stop_cancels_outstanding_action() {
    let exec = ScriptedExecutor::new([Reply::Hang]);
    let mut session = Session::in_memory();
    let control = session.control();
    let mut lp = PlanningLoop::new(
        config(2, Duration::from_secs(30)),
        exec,
        steps(&["[RUN] long-build", "[RUN] never-reached"]),
        ReportSink::new(),
    );

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.stop();
    });
    let outcome = tokio::time::timeout(Duration::from_secs(5), lp.run(&mut session, "build"))
        .await
        .expect("stop should end the run promptly")
        .unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(session.state(), AgentState::Stopped);
    let plan = lp.plans().active_plan().unwrap();
    assert_eq!(plan.step(1).unwrap().status(), StepStatus::NotStarted);
    assert_eq!(replay_state(&events(session.stream())), AgentState::Stopped);
}

#[tokio::test]
async fn question_waits_for_user_reply() {
    let exec = ScriptedExecutor::idle();
    let mut session = Session::in_memory();
    let stream = session.stream().clone();
    let control = session.control();
    let mut lp = PlanningLoop::new(
        LoopConfig::default(),
        exec,
        steps(&["[ASK] Which city?"]),
        ReportSink::new(),
    );

    tokio::spawn(async move {
        stream
            .wait_for(EventId(0), |e| e.as_action().is_some_and(|a| a.wait_for_response()))
            .await
            .unwrap();
        control.reply("Berlin").unwrap();
    });
    let outcome = tokio::time::timeout(Duration::from_secs(5), lp.run(&mut session, "weather"))
        .await
        .expect("reply should unblock the loop")
        .unwrap();

    let Outcome::Finished { summary } = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    assert!(summary.contains("Berlin"), "{summary}");
    assert_eq!(
        states(&events(session.stream())),
        vec![
            AgentState::Running,
            AgentState::AwaitingUserInput,
            AgentState::Running,
            AgentState::Finished,
        ]
    );
}

#[tokio::test]
async fn pause_holds_the_loop_until_resumed() {
    let exec = ScriptedExecutor::new([Reply::Ok("done")]);
    let mut session = Session::in_memory();
    let control = session.control();
    control.pause();
    let mut lp = PlanningLoop::new(
        LoopConfig::default(),
        exec.clone(),
        steps(&["[RUN] work"]),
        ReportSink::new(),
    );

    let resumer = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        resumer.resume();
    });
    let outcome = lp.run(&mut session, "work").await.unwrap();

    assert!(matches!(outcome, Outcome::Finished { .. }));
    assert_eq!(
        states(&events(session.stream())),
        vec![
            AgentState::Running,
            AgentState::Paused,
            AgentState::Running,
            AgentState::Finished,
        ]
    );
}

#[tokio::test]
async fn stop_while_paused_ends_in_stopped() {
    let exec = ScriptedExecutor::idle();
    let mut session = Session::in_memory();
    let control = session.control();
    control.pause();
    let mut lp = PlanningLoop::new(
        LoopConfig::default(),
        exec.clone(),
        steps(&["[RUN] work"]),
        ReportSink::new(),
    );

    let stopper = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.stop();
    });
    let outcome = lp.run(&mut session, "work").await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert!(exec.calls().is_empty());
    assert_eq!(
        states(&events(session.stream())),
        vec![AgentState::Running, AgentState::Paused, AgentState::Stopped]
    );
}

#[tokio::test]
async fn unavailable_stream_is_fatal() {
    let mut session = Session::in_memory();
    let exec = Arc::new(VanishingStorage {
        stream: session.stream().clone(),
    });
    let reports = ReportSink::new();
    let mut sub = reports.subscribe();
    let mut lp = PlanningLoop::new(
        LoopConfig::default(),
        exec,
        steps(&["[RUN] anything"]),
        reports.clone(),
    );

    let err = lp.run(&mut session, "go").await.unwrap_err();

    assert!(matches!(err, LoopError::StreamUnavailable(_)), "{err:?}");
    assert_eq!(session.state(), AgentState::Error);
    let last = sub.drain().pop().unwrap();
    assert_eq!(last.kind, ReportKind::Error);
    assert!(last.content.contains("disk detached"), "{}", last.content);
}

#[tokio::test]
async fn too_many_actions_are_truncated() {
    let exec = ScriptedExecutor::idle();
    let mut session = Session::in_memory();
    let step = (0..5).map(|i| format!("[RUN] cmd-{i}")).collect::<Vec<_>>().join("\n");
    let mut lp = PlanningLoop::new(
        LoopConfig {
            max_actions_per_step: 2,
            ..LoopConfig::default()
        },
        exec.clone(),
        Arc::new(StaticPlanner::new(vec![step])),
        ReportSink::new(),
    );

    lp.run(&mut session, "many").await.unwrap();
    assert_eq!(exec.calls(), vec!["cmd-0", "cmd-1"]);
}

#[tokio::test]
async fn errored_session_can_run_again() {
    let exec = ScriptedExecutor::new([Reply::Fail("first"), Reply::Ok("second")]);
    let mut session = Session::in_memory();
    let mut lp = PlanningLoop::new(
        config(0, Duration::from_secs(5)),
        exec,
        steps(&["[RUN] job"]),
        ReportSink::new(),
    );

    assert_eq!(
        lp.run(&mut session, "job").await.unwrap(),
        Outcome::Blocked { step: 0 }
    );
    let outcome = lp.run(&mut session, "job").await.unwrap();
    assert!(matches!(outcome, Outcome::Finished { .. }));
    assert_eq!(lp.plans().list().len(), 2);
}
