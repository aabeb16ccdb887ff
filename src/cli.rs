//! CLI argument parsing using clap.

use clap::{Parser, Subcommand};

/// Plan a request, then carry it out step by step.
///
/// Every action and observation is recorded in an event stream that can be
/// inspected afterwards with `planloop events`, `planloop plan` and
/// `planloop state`.
#[derive(Parser, Debug)]
#[command(name = "planloop", version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize a new planloop project
    Init,
    /// Plan and execute a request
    Run {
        /// What to do
        #[arg(value_name = "REQUEST")]
        request: String,

        /// Plan step, in order; tags such as [RUN], [READ], [WRITE], [THINK], [ASK] map to actions
        #[arg(long = "step", value_name = "TEXT")]
        steps: Vec<String>,

        /// Plan goal (defaults to the request)
        #[arg(long, value_name = "TEXT")]
        goal: Option<String>,

        /// Retries for a failed step
        #[arg(long, value_name = "N", env = "PLANLOOP_MAX_RETRIES")]
        max_retries: Option<u32>,

        /// Seconds to wait for each action's observation
        #[arg(long, value_name = "SECS", env = "PLANLOOP_TIMEOUT")]
        timeout: Option<u64>,

        /// Keep the event stream in memory instead of the project database
        #[arg(long)]
        memory: bool,
    },
    /// Print the events of a stored session
    Events {
        /// Session ID (defaults to the latest)
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// First event ID to print
        #[arg(long, value_name = "ID", default_value = "0")]
        from: u64,

        #[arg(long)]
        json: bool,
    },
    /// Show the latest plan recorded in a session
    Plan {
        /// Session ID (defaults to the latest)
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Show the agent state of a session
    State {
        /// Session ID (defaults to the latest)
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },
    /// List stored sessions
    Sessions,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
