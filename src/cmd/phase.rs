//! Run status, run listing, and operator reset.

use anyhow::{Context, Result};
use console::{StyledObject, style};
use std::path::Path;

use anvil::config::Config;
use anvil::store::{DbHandle, PhaseState, RunState, RunSummary};

/// Open the store only if a run was ever created here.
fn open_existing_store(project_dir: &Path) -> Result<Option<(Config, DbHandle)>> {
    use anvil::init::is_initialized;

    if !is_initialized(project_dir) {
        return Ok(None);
    }
    let config = Config::new(project_dir.to_path_buf(), false, None)?;
    if !config.db_path.exists() {
        return Ok(None);
    }
    let db = DbHandle::open(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    Ok(Some((config, db)))
}

fn styled_phase_state(state: PhaseState) -> StyledObject<&'static str> {
    let s = style(state.as_str());
    match state {
        PhaseState::Complete => s.green(),
        PhaseState::Executing => s.cyan(),
        PhaseState::Failed => s.red(),
        PhaseState::Blocked | PhaseState::NeedsReview => s.yellow(),
        PhaseState::Queued => s.dim(),
    }
}

fn styled_run_state(state: RunState) -> StyledObject<&'static str> {
    let s = style(state.as_str()).bold();
    match state {
        RunState::DoneSuccess => s.green(),
        RunState::DoneNeedsReview | RunState::Paused => s.yellow(),
        RunState::Running => s.cyan(),
        RunState::Queued => s.dim(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

pub fn cmd_status(project_dir: &Path, run_id: Option<&str>) -> Result<()> {
    println!();
    println!("Anvil Status");
    println!("============");
    println!();

    let Some((_config, db)) = open_existing_store(project_dir)? else {
        if anvil::init::is_initialized(project_dir) {
            println!("No runs yet.");
            println!();
            println!("Run 'anvil run --plan <file>' to start one.");
        } else {
            println!("Project: Not initialized");
            println!();
            println!("Run 'anvil init' to initialize the project.");
        }
        println!();
        return Ok(());
    };

    let store = db.lock_sync()?;
    let run = match run_id {
        Some(id) => store.get_run(id)?,
        None => match store.latest_run()? {
            Some(run) => run,
            None => {
                println!("No runs yet.");
                println!();
                return Ok(());
            }
        },
    };
    let summary = store.run_summary(&run.id)?;
    drop(store);

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let run = &summary.run;
    println!(
        "Run:      {} ({})",
        style(&run.id).bold(),
        run.plan_name.as_deref().unwrap_or("unnamed plan")
    );
    println!("State:    {}", styled_run_state(run.state));
    if let Some(reason) = &run.stop_reason {
        println!("Reason:   {}", reason);
    }
    match run.token_cap {
        Some(cap) => println!("Tokens:   {} of {}", run.tokens_used, cap),
        None => println!("Tokens:   {}", run.tokens_used),
    }
    if !run.disabled_providers.is_empty() {
        println!("Disabled: {}", run.disabled_providers.join(", "));
    }
    println!(
        "Phases:   {} complete, {} needs review, {} blocked, {} total",
        summary.count(PhaseState::Complete),
        summary.count(PhaseState::NeedsReview),
        summary.count(PhaseState::Blocked),
        summary.phases.len()
    );

    for tier in &summary.tiers {
        println!();
        println!("{}", style(format!("Tier {}: {}", tier.tier_index, tier.name)).bold());
        println!(
            "  {:<20} {:<13} {:<8} {:<8} Last failure",
            "Phase", "State", "Retries", "Budget"
        );
        for phase in summary
            .phases
            .iter()
            .filter(|p| p.tier_index == tier.tier_index)
        {
            let budget = phase
                .token_budget
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<20} {:<13} {:<8} {:<8} {}",
                truncate(&phase.phase_id, 20),
                styled_phase_state(phase.state),
                phase.retry_attempt,
                budget,
                phase
                    .last_failure_reason
                    .as_deref()
                    .map(|r| truncate(r, 60))
                    .unwrap_or_default()
            );
        }
    }
    println!();
}

pub fn cmd_list(project_dir: &Path) -> Result<()> {
    let Some((_config, db)) = open_existing_store(project_dir)? else {
        println!("No runs yet.");
        return Ok(());
    };
    let runs = db.lock_sync()?.list_runs()?;
    if runs.is_empty() {
        println!("No runs yet.");
        return Ok(());
    }

    println!();
    println!(
        "{:<34} {:<18} {:<10} {:<20} Plan",
        "Run", "State", "Tokens", "Created"
    );
    for run in runs {
        println!(
            "{:<34} {:<18} {:<10} {:<20} {}",
            run.id,
            styled_run_state(run.state),
            run.tokens_used,
            truncate(&run.created_at, 20),
            run.plan_name.as_deref().unwrap_or("-")
        );
    }
    println!();
    Ok(())
}

/// Requeue one phase with a fresh retry budget.
pub fn cmd_reset(project_dir: &Path, run_id: &str, phase_id: &str) -> Result<()> {
    let Some((_config, db)) = open_existing_store(project_dir)? else {
        anyhow::bail!("No runs found. Run 'anvil run --plan <file>' first.");
    };
    db.lock_sync()?
        .reset_phase(run_id, phase_id)
        .with_context(|| format!("Failed to reset phase {} of run {}", phase_id, run_id))?;

    println!(
        "{} Phase {} requeued with a fresh retry budget",
        style("↺").green().bold(),
        style(phase_id).bold()
    );
    println!("Run 'anvil resume {}' to continue.", run_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_keeps_first_line() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("line one\nline two", 20), "line one");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
