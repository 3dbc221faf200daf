//! CLI command definitions for the `autoflow` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow definitions live
//! under `autoflow dag`; instance operations are top-level verbs.

pub mod dag;
pub mod instance;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

use autoflow_types::instance::TaskInstanceStatus;

/// Compile, run and resume workflows.
#[derive(Parser)]
#[command(name = "autoflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and compile a step tree without saving it.
    Compile {
        /// Path to a JSON or YAML workflow document.
        file: PathBuf,

        /// Also print the generated task views.
        #[arg(long)]
        views: bool,
    },

    /// Manage workflow definitions.
    Dag {
        #[command(subcommand)]
        action: dag::DagCommand,
    },

    /// Start a new instance of a workflow in `init`.
    Run {
        dag_id: Uuid,

        /// Run in VM mode.
        #[arg(long)]
        vm: bool,

        /// Persist execution as an event log.
        #[arg(long)]
        events: bool,

        /// Initial variables as a JSON object.
        #[arg(long)]
        vars: Option<String>,

        /// Drive the new instance immediately.
        #[arg(long)]
        execute: bool,
    },

    /// Drive an instance until it finishes, blocks or is canceled.
    Execute { instance_id: Uuid },

    /// Cancel an instance and its unfinished tasks.
    Cancel { instance_id: Uuid },

    /// Reset failed and canceled tasks of an instance for another run.
    Retry { instance_id: Uuid },

    /// Inject an external result into blocked tasks.
    Resume {
        /// Task instance ids to resume.
        #[arg(required = true)]
        task_ids: Vec<Uuid>,

        /// Status to apply: success, failed or retrying.
        #[arg(long, default_value = "success")]
        status: TaskInstanceStatus,

        /// Result payload as a JSON object.
        #[arg(long, default_value = "{}")]
        result: String,
    },

    /// Show an instance.
    Instance { instance_id: Uuid },

    /// List the materialized task views of an instance.
    Tasks {
        instance_id: Uuid,

        /// Zero-based page number.
        #[arg(long, default_value = "0")]
        page: u64,

        /// Page size (omit for all).
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
