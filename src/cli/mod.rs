//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Nexus - multi-agent LLM orchestration engine.
#[derive(Debug, Parser)]
#[command(name = "nexus", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine daemon: recovery, job intake, streaming.
    Serve,

    /// Submit one task and wait for its result.
    Submit {
        /// The objective to orchestrate.
        objective: String,

        /// Task complexity: simple, medium, complex, extreme.
        #[arg(long, default_value = "medium")]
        complexity: String,

        /// Upper bound on the agent cohort.
        #[arg(long)]
        max_agents: Option<usize>,

        /// Tenant company id.
        #[arg(long, env = "NEXUS_COMPANY_ID", default_value = "local")]
        company: String,

        /// Tenant app id.
        #[arg(long, env = "NEXUS_APP_ID", default_value = "cli")]
        app: String,

        /// Hard timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Continue an existing conversation thread.
        #[arg(long)]
        thread_id: Option<Uuid>,
    },

    /// Show the status of a task.
    Status {
        /// Task id to query.
        task_id: Uuid,
    },

    /// Cancel a running task.
    Cancel {
        /// Task id to cancel.
        task_id: Uuid,
    },

    /// List the gateway model catalog.
    Models {
        /// Include zero-priced / `:free` models.
        #[arg(long)]
        include_free: bool,
    },
}
