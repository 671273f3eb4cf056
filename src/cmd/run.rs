//! Plan execution: `anvil run --plan <file>` and `anvil resume <run-id>`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use anvil::agents::{Auditor, CommandAuditor, CommandBuilder, CommandDoctor, Doctor, NoopAuditor};
use anvil::config::Config;
use anvil::errors::{StartupError, StoreError};
use anvil::orchestrator::{Agents, Executor, ExecutorSettings};
use anvil::plan::Plan;
use anvil::store::DbHandle;

pub fn check_run_prerequisites(project_dir: &Path) -> Result<()> {
    use anvil::init::is_initialized;

    if !is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'anvil init' first.");
    }
    Ok(())
}

/// Ingest a plan (or pick up the unfinished run made from it) and execute.
pub async fn cmd_run(
    project_dir: &Path,
    plan_path: &Path,
    verbose: bool,
    max_iterations: Option<u32>,
    token_cap: Option<u64>,
    cancel: CancellationToken,
) -> Result<i32> {
    check_run_prerequisites(project_dir)?;
    let config = Config::new(project_dir.to_path_buf(), verbose, max_iterations)?;
    config.ensure_directories()?;
    let agents = build_agents(&config)?;

    let plan = Plan::load(plan_path).map_err(|e| StartupError::InvalidPlan(format!("{:#}", e)))?;
    let plan_hash = plan
        .hash()
        .map_err(|e| StartupError::InvalidPlan(format!("{:#}", e)))?;
    let db = open_store(&config)?;

    let execution = &config.anvil_config().toml.execution;
    let cap = token_cap.or(execution.token_cap);
    let max_phases = execution.max_phases;
    let protected = config.anvil_config().protected_paths();

    let existing = db
        .call(move |s| s.find_resumable_run(&plan_hash))
        .await
        .map_err(|e| unreachable_store(&config, e))?;
    let (run_id, created) = match existing {
        Some(run) => {
            println!(
                "{} Resuming run {} ({}, {} tokens used)",
                style("↻").cyan().bold(),
                style(&run.id).bold(),
                run.state,
                run.tokens_used
            );
            (run.id, false)
        }
        None => {
            let run_id = db
                .call(move |s| s.ingest_plan(&plan, max_phases, cap, &protected))
                .await
                .map_err(|e| match e {
                    StoreError::InvalidPlan(problems) => StartupError::InvalidPlan(problems),
                    other => unreachable_store(&config, other),
                })?;
            println!(
                "{} Created run {} from {}",
                style("+").green().bold(),
                style(&run_id).bold(),
                plan_path.display()
            );
            (run_id, true)
        }
    };

    let result = execute(config, db.clone(), agents, &run_id, cancel).await;
    if created
        && let Err(e) = &result
        && e.downcast_ref::<StartupError>().is_some()
    {
        let id = run_id.clone();
        match db.call(move |s| s.delete_run(&id)).await {
            Ok(()) => tracing::info!(run_id = %run_id, "discarded run that failed to start"),
            Err(cleanup) => {
                tracing::warn!(run_id = %run_id, error = %cleanup, "failed to discard run")
            }
        }
    }
    result
}

/// Continue a paused or interrupted run.
pub async fn cmd_resume(
    project_dir: &Path,
    run_id: &str,
    verbose: bool,
    max_iterations: Option<u32>,
    cancel: CancellationToken,
) -> Result<i32> {
    check_run_prerequisites(project_dir)?;
    let config = Config::new(project_dir.to_path_buf(), verbose, max_iterations)?;
    config.ensure_directories()?;
    let agents = build_agents(&config)?;
    let db = open_store(&config)?;

    println!("{} Resuming run {}", style("↻").cyan().bold(), style(run_id).bold());
    execute(config, db, agents, run_id, cancel).await
}

async fn execute(
    config: Config,
    db: DbHandle,
    agents: Agents,
    run_id: &str,
    cancel: CancellationToken,
) -> Result<i32> {
    let settings = ExecutorSettings::from_config(&config);
    tracing::debug!(?settings, "executor settings");

    let executor = Executor::new(config, settings, db, agents, cancel);
    let outcome = executor.execute(run_id).await?;
    Ok(outcome.exit_code())
}

/// Wire the configured commands into the executor's collaborators.
pub fn build_agents(config: &Config) -> Result<Agents> {
    let anvil = config.anvil_config();
    let toml = &anvil.toml;

    let builder_cmd = anvil.builder_cmd().ok_or_else(|| {
        StartupError::Other(anyhow::anyhow!(
            "No builder command configured. Set [builder] command in {} or ANVIL_BUILDER_CMD",
            anvil.config_file().display()
        ))
    })?;
    let builder = Arc::new(CommandBuilder::new(
        builder_cmd,
        &config.project_dir,
        toml.builder.timeout_secs,
    ));

    let auditor: Arc<dyn Auditor> = match anvil.test_cmd() {
        Some(cmd) => Arc::new(CommandAuditor::new(
            cmd,
            &config.project_dir,
            toml.auditor.timeout_secs,
        )),
        None => {
            tracing::info!("no test command configured, changes are accepted without tests");
            Arc::new(NoopAuditor)
        }
    };

    let doctor = toml.doctor.command.as_ref().map(|cmd| {
        Arc::new(CommandDoctor::new(
            cmd.clone(),
            &config.project_dir,
            toml.doctor.timeout_secs,
        )) as Arc<dyn Doctor>
    });

    Ok(Agents {
        builder,
        auditor,
        doctor,
    })
}

fn open_store(config: &Config) -> Result<DbHandle> {
    let db = DbHandle::open(&config.db_path).map_err(|e| unreachable_store(config, e))?;
    Ok(db)
}

fn unreachable_store(config: &Config, source: StoreError) -> StartupError {
    StartupError::StoreUnreachable {
        path: config.db_path.clone(),
        source,
    }
}
