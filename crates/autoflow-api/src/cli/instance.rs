//! Instance commands: run, execute, cancel, retry, resume, tasks.

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use autoflow_core::service::workflow::RunRequest;
use autoflow_core::workflow::resume::ResumeOutcome;
use autoflow_types::instance::{
    DagInstance, DagInstanceStatus, EventPersistence, InstanceMode, TaskInstanceStatus,
};

use super::output::{instance_status, parse_json_object, preview, print_json, task_status};
use crate::state::AppState;

pub struct RunArgs {
    pub vm: bool,
    pub events: bool,
    pub vars: Option<String>,
    pub execute: bool,
}

pub async fn handle_run(dag_id: &Uuid, args: RunArgs, state: &AppState, json: bool) -> Result<()> {
    let vars = match args.vars.as_deref() {
        Some(raw) => parse_json_object(raw, "vars")?,
        None => Default::default(),
    };
    let request = RunRequest {
        mode: if args.vm { InstanceMode::Vm } else { InstanceMode::Schedule },
        event_persistence: if args.events {
            EventPersistence::Sql
        } else {
            EventPersistence::default()
        },
        vars,
        call_chain: Vec::new(),
    };

    let svc = &state.workflow_service;
    let mut instance = svc.run_instance(dag_id, request).await?;
    if args.execute {
        svc.execute(&instance.id).await?;
        instance = svc.get_instance(&instance.id).await?;
    }

    if json {
        return print_json(&instance);
    }
    println!();
    println!(
        "  {} Started instance {} ({})",
        style("*").green().bold(),
        style(instance.id).cyan(),
        instance_status(instance.status)
    );
    if !args.execute {
        println!(
            "  Drive it with: {}",
            style(format!("autoflow execute {}", instance.id)).dim()
        );
    }
    println!();
    Ok(())
}

pub async fn handle_execute(instance_id: &Uuid, state: &AppState, json: bool) -> Result<()> {
    let status = state.workflow_service.execute(instance_id).await?;
    if json {
        return print_json(&serde_json::json!({ "id": instance_id, "status": status.as_str() }));
    }
    println!();
    println!("  Instance {instance_id} is {}", instance_status(status));
    if status == DagInstanceStatus::Blocked {
        println!(
            "  Blocked tasks wait for: {}",
            style("autoflow resume <task_id>... --result '{...}'").dim()
        );
    }
    println!();
    Ok(())
}

pub async fn handle_cancel(instance_id: &Uuid, state: &AppState, json: bool) -> Result<()> {
    let canceled = state.workflow_service.cancel(instance_id).await?;
    report_tasks("Canceled", instance_id, &canceled, json)
}

pub async fn handle_retry(instance_id: &Uuid, state: &AppState, json: bool) -> Result<()> {
    let reset = state.workflow_service.retry(instance_id).await?;
    report_tasks("Reset", instance_id, &reset, json)
}

fn report_tasks(verb: &str, instance_id: &Uuid, task_ids: &[Uuid], json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "id": instance_id, "tasks": task_ids }));
    }
    println!();
    println!(
        "  {} {verb} {} task(s) of instance {instance_id}",
        style("*").green().bold(),
        task_ids.len()
    );
    println!();
    Ok(())
}

pub async fn handle_resume(
    task_ids: &[Uuid],
    status: TaskInstanceStatus,
    result: &str,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let result = parse_json_object(result, "result")?;
    let outcome = state.workflow_service.resume(task_ids, &result, status).await?;

    let applied = match &outcome {
        ResumeOutcome::Applied(ids) => ids.clone(),
        ResumeOutcome::AlreadyApplied => Vec::new(),
    };
    if json {
        return print_json(&serde_json::json!({
            "applied": !applied.is_empty(),
            "instances": applied,
        }));
    }
    println!();
    if applied.is_empty() {
        println!("  Nothing to resume: the tasks already moved past blocked.");
    } else {
        println!(
            "  {} Resumed {} task(s) with status {}",
            style("*").green().bold(),
            task_ids.len(),
            task_status(status)
        );
        for id in &applied {
            println!("  Continue with: {}", style(format!("autoflow execute {id}")).dim());
        }
    }
    println!();
    Ok(())
}

pub async fn handle_show(instance_id: &Uuid, state: &AppState, json: bool) -> Result<()> {
    let instance = state.workflow_service.get_instance(instance_id).await?;
    if json {
        return print_json(&instance);
    }
    print_instance(&instance);
    Ok(())
}

fn print_instance(instance: &DagInstance) {
    println!();
    println!(
        "  Instance {} ({})",
        style(instance.id).cyan().bold(),
        instance_status(instance.status)
    );
    println!("  Dag: {}  Version: {}", instance.dag_id, instance.version_id);
    println!(
        "  Trigger: {}  Mode: {}  Events: {}",
        instance.trigger.as_str(),
        instance.mode.as_str(),
        instance.event_persistence.as_str()
    );
    if let Some(reason) = &instance.reason {
        println!("  Reason: {}", style(reason).red());
    }
    if !instance.vars.is_empty() {
        println!("  Vars: {}", preview(&Value::Object(instance.vars.clone()), 120));
    }
    println!("  Created: {}", instance.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ended) = instance.ended_at {
        println!("  Ended: {}", ended.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
}

pub async fn handle_tasks(
    instance_id: &Uuid,
    page: u64,
    limit: Option<u64>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let (total, tasks) = state
        .workflow_service
        .list_task_results(instance_id, page, limit)
        .await?;

    if json {
        return print_json(&serde_json::json!({ "total": total, "tasks": tasks }));
    }

    if tasks.is_empty() {
        println!();
        println!("  No tasks on this page ({total} in total).");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Action"),
            Cell::new("Status"),
            Cell::new("Result"),
        ]);
    for t in &tasks {
        let status = Cell::new(t.status.as_str()).fg(match t.status {
            TaskInstanceStatus::Success => Color::Green,
            TaskInstanceStatus::Failed => Color::Red,
            TaskInstanceStatus::Blocked => Color::Yellow,
            TaskInstanceStatus::Skipped | TaskInstanceStatus::Canceled => Color::DarkGrey,
            _ => Color::Reset,
        });
        let result = t
            .results
            .as_ref()
            .or(t.reason.as_ref())
            .map(|v| preview(v, 60))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&t.task_id),
            Cell::new(t.id),
            Cell::new(&t.action_name),
            status,
            Cell::new(result),
        ]);
    }

    println!();
    println!("{table}");
    println!("  {} of {total} task(s), page {page}", tasks.len());
    println!();
    Ok(())
}
