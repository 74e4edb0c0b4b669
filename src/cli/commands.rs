//! Command handlers.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use std::sync::Arc;
use uuid::Uuid;

use crate::application::Engine;
use crate::domain::models::config::Config;
use crate::domain::models::{Complexity, SubmitOptions, TaskConstraints, TaskSubmission, TenantContext};
use crate::domain::ports::ModelGateway;
use crate::infrastructure::analytics::SqliteAnalyticsStore;
use crate::infrastructure::gateway::HttpModelGateway;
use crate::infrastructure::jobstore::InMemoryJobStore;
use crate::infrastructure::memory::InMemoryMemoryStore;

/// Wire an engine from config with the default adapters.
pub async fn build_engine(config: Config) -> Result<Arc<Engine>> {
    let gateway = Arc::new(
        HttpModelGateway::new(&config.gateway).context("failed to build gateway client")?,
    );
    if let Some(parent) = std::path::Path::new(&config.analytics.path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let analytics = Arc::new(
        SqliteAnalyticsStore::open(&config.analytics.path)
            .await
            .context("failed to open analytics database")?,
    );
    let memory = Arc::new(InMemoryMemoryStore::new());
    let job_store = Arc::new(InMemoryJobStore::new());

    Ok(Arc::new(Engine::new(
        config, gateway, memory, job_store, analytics,
    )))
}

/// `nexus serve`: run until interrupted.
pub async fn handle_serve(config: Config) -> Result<()> {
    let engine = build_engine(config).await?;

    match engine.gateway().health_check().await {
        Ok(true) => println!("gateway reachable"),
        Ok(false) => eprintln!("warning: gateway unreachable or credentials rejected"),
        Err(err) => eprintln!("warning: gateway health check failed: {err}"),
    }

    let report = engine.start().await;
    println!(
        "engine up (recovered {} checkpoints, skipped {})",
        report.recovered, report.skipped
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    println!("shutting down...");
    engine.shutdown().await;
    Ok(())
}

/// `nexus submit`: run one task to completion and print the result.
#[allow(clippy::too_many_arguments)]
pub async fn handle_submit(
    config: Config,
    objective: String,
    complexity: &str,
    max_agents: Option<usize>,
    company: String,
    app: String,
    timeout_ms: Option<u64>,
    thread_id: Option<Uuid>,
    json: bool,
) -> Result<()> {
    let engine = build_engine(config).await?;
    engine.start().await;

    let tenant = TenantContext::new(company, app);
    let submission = TaskSubmission {
        objective,
        options: SubmitOptions {
            complexity: Complexity::from_str(complexity),
            timeout_ms,
            thread_id,
            constraints: TaskConstraints {
                max_agents,
                ..Default::default()
            },
            ..Default::default()
        },
        context: Default::default(),
    };

    let response = engine
        .submit_task(submission, tenant)
        .await
        .context("task failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("task     {}", response.task_id);
        println!("thread   {}", response.thread_id);
        println!("status   {}", response.status.as_str());
        if let Some(strategy) = &response.metadata.strategy {
            println!("strategy {strategy}");
        }
        if let Some(strength) = response.metadata.consensus_strength {
            println!("consensus strength {strength:.2}");
        }
        if let Some(output) = response
            .result
            .as_ref()
            .and_then(|r| r.get("final_output"))
            .and_then(|v| v.as_str())
        {
            println!("\n{output}");
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// `nexus status`: report a task's status.
///
/// Tasks live in the orchestrator's in-process table for the retention
/// window; jobs submitted through the durable queue are queried from the
/// job store as the fallback.
pub async fn handle_status(config: Config, task_id: Uuid, json: bool) -> Result<()> {
    let engine = build_engine(config).await?;
    engine.start().await;

    match engine.get_task_status(task_id).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("task     {task_id}");
                println!("status   {}", report.status.as_str());
                println!("progress {}%", report.progress);
                if let Some(error) = &report.error {
                    println!("error    {} ({})", error.message, error.code);
                }
            }
        }
        Err(_) => match engine.job_manager().get_task_status(task_id).await? {
            Some(view) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&view)?);
                } else {
                    println!("task     {task_id}");
                    println!("status   {}", view.status.as_str());
                    println!("progress {}%", view.progress);
                    if let Some(error) = &view.error {
                        println!("error    {} ({})", error.message, error.code);
                    }
                }
            }
            None => {
                eprintln!("task {task_id} not found");
            }
        },
    }

    engine.shutdown().await;
    Ok(())
}

/// `nexus cancel`: cancel a task.
pub async fn handle_cancel(config: Config, task_id: Uuid) -> Result<()> {
    let engine = build_engine(config).await?;
    engine.start().await;

    match engine.cancel(task_id).await {
        Ok(()) => println!("task {task_id} cancelled"),
        Err(err) => eprintln!("cancel failed: {err}"),
    }

    engine.shutdown().await;
    Ok(())
}

/// `nexus models`: print the catalog.
pub async fn handle_models(config: Config, include_free: bool, json: bool) -> Result<()> {
    let gateway =
        HttpModelGateway::new(&config.gateway).context("failed to build gateway client")?;
    let mut models = gateway.list_models().await.context("catalog fetch failed")?;
    if !include_free {
        models.retain(|m| !m.is_free());
    }
    models.sort_by(|a, b| a.id.cmp(&b.id));

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "model",
        "context",
        "prompt $/tok",
        "completion $/tok",
    ]);
    for model in &models {
        table.add_row(vec![
            Cell::new(&model.id),
            Cell::new(model.context_length),
            Cell::new(format!("{:.8}", model.pricing.prompt)),
            Cell::new(format!("{:.8}", model.pricing.completion)),
        ]);
    }
    println!("{table}");
    println!("{} models", models.len());
    Ok(())
}
