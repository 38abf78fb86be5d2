use crate::core::triage::TriageStatus;
use crate::domain::model::Trend;
use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "coachlink")]
#[command(about = "Coaching platform client: client triage, roster and live coherence updates")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "coachlink.toml")]
    pub config: String,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Classify a single coherence snapshot
    Triage {
        #[arg(long)]
        current: f64,

        #[arg(long, allow_negative_numbers = true)]
        derivative: f64,

        #[arg(long, default_value = "stable")]
        trend: Trend,
    },

    /// Fetch the client roster and list it most urgent first
    Roster {
        #[arg(long)]
        coach_id: Option<String>,

        /// Only show clients at this status or more urgent
        #[arg(long)]
        min_status: Option<TriageStatus>,

        /// Also write the roster to this CSV file
        #[arg(long)]
        csv: Option<String>,

        #[arg(long, env = "COACHLINK_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Stream live coherence updates until interrupted
    Watch {
        /// Client ids to subscribe to (repeatable)
        #[arg(long = "client")]
        clients: Vec<String>,

        /// Subscribe to every client of the tenant
        #[arg(long, conflicts_with = "clients")]
        all: bool,

        #[arg(long, env = "COACHLINK_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Decode a session cookie and check it against the role gate
    Session {
        /// Raw `Cookie` header value
        #[arg(long)]
        cookie: String,

        /// Requested path
        #[arg(long, default_value = "/dashboard")]
        path: String,
    },
}
