//! Autoflow CLI entry point.
//!
//! Binary name: `autoflow`
//!
//! Parses CLI arguments, initializes tracing, the database and the workflow
//! service, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use autoflow_observe::tracing_setup::{init_tracing_with, shutdown_tracing, LogFormat};
use cli::instance::RunArgs;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info,autoflow=debug",
        _ => "trace",
    };
    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Pretty };
    if let Err(e) = init_tracing_with(format, cli.otel, filter) {
        eprintln!("Warning: tracing setup failed: {e}");
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "autoflow", &mut std::io::stdout());
        return Ok(());
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Compile { file, views } => {
            cli::dag::handle_compile(&file, views, &state, json).await?;
        }
        Commands::Dag { action } => {
            cli::dag::handle_dag_command(action, &state, json).await?;
        }
        Commands::Run {
            dag_id,
            vm,
            events,
            vars,
            execute,
        } => {
            let args = RunArgs {
                vm,
                events,
                vars,
                execute,
            };
            cli::instance::handle_run(&dag_id, args, &state, json).await?;
        }
        Commands::Execute { instance_id } => {
            cli::instance::handle_execute(&instance_id, &state, json).await?;
        }
        Commands::Cancel { instance_id } => {
            cli::instance::handle_cancel(&instance_id, &state, json).await?;
        }
        Commands::Retry { instance_id } => {
            cli::instance::handle_retry(&instance_id, &state, json).await?;
        }
        Commands::Resume {
            task_ids,
            status,
            result,
        } => {
            cli::instance::handle_resume(&task_ids, status, &result, &state, json).await?;
        }
        Commands::Instance { instance_id } => {
            cli::instance::handle_show(&instance_id, &state, json).await?;
        }
        Commands::Tasks {
            instance_id,
            page,
            limit,
        } => {
            cli::instance::handle_tasks(&instance_id, page, limit, &state, json).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
