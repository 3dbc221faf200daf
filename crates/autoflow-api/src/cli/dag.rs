//! `autoflow compile` and `autoflow dag ...`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use uuid::Uuid;

use autoflow_core::repository::DagFilter;
use autoflow_core::workflow::definition::{parse_document, WorkflowDocument};
use autoflow_types::dag::{Dag, DagStatus};
use autoflow_types::operator::TriggerKind;
use autoflow_types::task::Task;

use super::output::print_json;
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum DagCommand {
    /// Create a workflow from a JSON or YAML document.
    Create {
        file: std::path::PathBuf,

        /// Allow restricted actions.
        #[arg(long)]
        admin: bool,
    },

    /// Replace the step tree of a workflow, bumping its version.
    Update {
        dag_id: Uuid,
        file: std::path::PathBuf,

        #[arg(long)]
        admin: bool,
    },

    /// Show a workflow and its compiled tasks.
    Show { dag_id: Uuid },

    /// List workflows.
    #[command(alias = "ls")]
    List {
        /// Filter by status (normal, stopped).
        #[arg(long)]
        status: Option<DagStatus>,

        /// Filter by trigger kind (manually, cron, event, ...).
        #[arg(long)]
        trigger: Option<TriggerKind>,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long)]
        offset: Option<u32>,
    },

    /// List the stored versions of a workflow.
    Versions { dag_id: Uuid },

    /// Stop a workflow so no new instances start.
    Stop { dag_id: Uuid },

    /// Reopen a stopped workflow.
    Start { dag_id: Uuid },

    /// Delete a workflow with its versions and instances.
    #[command(alias = "rm")]
    Delete { dag_id: Uuid },
}

pub async fn handle_dag_command(cmd: DagCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        DagCommand::Create { file, admin } => {
            let doc = load_document(&file).await?;
            let dag = state.workflow_service.create_dag(doc, admin).await?;
            print_saved("Created", &dag, json)
        }
        DagCommand::Update { dag_id, file, admin } => {
            let doc = load_document(&file).await?;
            let dag = state.workflow_service.update_dag(&dag_id, doc, admin).await?;
            print_saved("Updated", &dag, json)
        }
        DagCommand::Show { dag_id } => {
            let dag = state.workflow_service.get_dag(&dag_id).await?;
            if json {
                return print_json(&dag);
            }
            println!();
            println!("  {} ({})", style(&dag.name).cyan().bold(), dag.id);
            if let Some(description) = &dag.description {
                println!("  {description}");
            }
            println!(
                "  Status: {}  Trigger: {}  Type: {}  Version: {}",
                dag.status,
                dag.trigger.as_str(),
                dag.dag_type.as_str(),
                dag.version
            );
            print_tasks(&dag.tasks);
            Ok(())
        }
        DagCommand::List {
            status,
            trigger,
            limit,
            offset,
        } => {
            let filter = DagFilter {
                status,
                trigger,
                removed: Some(false),
                limit,
                offset,
                ..Default::default()
            };
            let dags = state.workflow_service.list_dags(&filter).await?;
            list_dags(&dags, json)
        }
        DagCommand::Versions { dag_id } => {
            let versions = state.workflow_service.list_versions(&dag_id).await?;
            if json {
                return print_json(&versions);
            }
            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Version").fg(Color::Cyan),
                    Cell::new("ID"),
                    Cell::new("Tasks"),
                    Cell::new("Created"),
                ]);
            for v in &versions {
                table.add_row(vec![
                    Cell::new(v.version),
                    Cell::new(v.id),
                    Cell::new(v.tasks.len()),
                    Cell::new(v.created_at.format("%Y-%m-%d %H:%M:%S")),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }
        DagCommand::Stop { dag_id } => set_status(state, &dag_id, DagStatus::Stopped, json).await,
        DagCommand::Start { dag_id } => set_status(state, &dag_id, DagStatus::Normal, json).await,
        DagCommand::Delete { dag_id } => {
            state.workflow_service.delete_dag(&dag_id).await?;
            if json {
                return print_json(&serde_json::json!({ "deleted": dag_id }));
            }
            println!();
            println!("  {} Deleted workflow {dag_id}", style("*").green().bold());
            println!();
            Ok(())
        }
    }
}

/// Compile a document without persisting it.
pub async fn handle_compile(file: &Path, views: bool, state: &AppState, json: bool) -> Result<()> {
    let doc = load_document(file).await?;
    let graph = state.workflow_service.compile(&doc.steps)?;

    if json {
        let mut out = serde_json::json!({ "tasks": graph.tasks });
        if views {
            out["views"] = serde_json::to_value(&graph.views)?;
        }
        return print_json(&out);
    }

    println!();
    println!(
        "  {} {} steps compiled into {} tasks",
        style("*").green().bold(),
        doc.steps.len(),
        graph.tasks.len()
    );
    print_tasks(&graph.tasks);
    if views {
        println!("{}", serde_json::to_string_pretty(&graph.views)?);
        println!();
    }
    Ok(())
}

async fn load_document(file: &Path) -> Result<WorkflowDocument> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut doc = parse_document(&text)?;
    if doc.name.is_empty() {
        if let Some(stem) = file.file_stem() {
            doc.name = stem.to_string_lossy().into_owned();
        }
    }
    Ok(doc)
}

async fn set_status(state: &AppState, dag_id: &Uuid, status: DagStatus, json: bool) -> Result<()> {
    let dag = state.workflow_service.set_dag_status(dag_id, status).await?;
    if json {
        return print_json(&dag);
    }
    println!();
    println!("  Workflow '{}' is now {}", style(&dag.name).cyan(), dag.status);
    println!();
    Ok(())
}

fn print_saved(verb: &str, dag: &Dag, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "id": dag.id,
            "name": dag.name,
            "version": dag.version,
            "version_id": dag.version_id,
            "trigger": dag.trigger.as_str(),
            "tasks": dag.tasks.len(),
        }));
    }
    println!();
    println!(
        "  {} {verb} workflow '{}'",
        style("*").green().bold(),
        style(&dag.name).cyan()
    );
    println!("  ID: {}", dag.id);
    println!("  Version: {} ({})", dag.version, dag.version_id);
    println!("  Tasks: {}", dag.tasks.len());
    println!();
    println!(
        "  Start an instance: {}",
        style(format!("autoflow run {}", dag.id)).dim()
    );
    println!();
    Ok(())
}

fn list_dags(dags: &[Dag], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = dags
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "status": d.status.to_string(),
                    "trigger": d.trigger.as_str(),
                    "version": d.version,
                    "tasks": d.tasks.len(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if dags.is_empty() {
        println!();
        println!("  No workflows found.");
        println!(
            "  Create one with: {}",
            style("autoflow dag create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Version"),
            Cell::new("Tasks"),
        ]);
    for d in dags {
        let status = match d.status {
            DagStatus::Normal => Cell::new(d.status).fg(Color::Green),
            DagStatus::Stopped => Cell::new(d.status).fg(Color::DarkGrey),
        };
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.id),
            status,
            Cell::new(d.trigger.as_str()),
            Cell::new(d.version),
            Cell::new(d.tasks.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn print_tasks(tasks: &[Task]) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Action"),
            Cell::new("Depends on"),
            Cell::new("Timeout (s)"),
        ]);
    for t in tasks {
        table.add_row(vec![
            Cell::new(&t.id),
            Cell::new(&t.action_name),
            Cell::new(t.depend_on.join(", ")),
            Cell::new(t.timeout_secs),
        ]);
    }
    println!();
    println!("{table}");
    println!();
}
