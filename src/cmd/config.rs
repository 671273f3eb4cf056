//! Configuration view and validation commands (`anvil config`).

use anyhow::Result;

use super::super::ConfigCommands;

fn opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| format!("\"{}\"", v))
        .unwrap_or_else(|| "(unset)".to_string())
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use anvil::anvil_config::{AnvilConfig, AnvilToml, CONFIG_FILE};
    use anvil::init::get_anvil_dir;

    let anvil_dir = get_anvil_dir(project_dir);
    let config_path = anvil_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Anvil Configuration");
            println!("===================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                AnvilToml::load(&config_path)?
            } else {
                println!("No anvil.toml found at {}", config_path.display());
                println!("Using default configuration.");
                AnvilToml::default()
            };
            println!();

            let e = &toml.execution;
            println!("[execution]");
            println!("  max_retry_attempts = {}", e.max_retry_attempts);
            println!("  max_iterations = {}", e.max_iterations);
            println!("  max_phases = {}", e.max_phases);
            match e.token_cap {
                Some(cap) => println!("  token_cap = {}", cap),
                None => println!("  token_cap = (unset)"),
            }
            println!("  backoff_base_ms = {}", e.backoff_base_ms);
            println!("  backoff_max_ms = {}", e.backoff_max_ms);
            println!("  disable_provider_after = {}", e.disable_provider_after);
            println!();

            println!("[budget]");
            println!("  safety_margin = {}", toml.budget.safety_margin);
            println!("  ceiling = {}", toml.budget.ceiling);
            println!();

            let l = &toml.lease;
            println!("[lease]");
            println!("  ttl_seconds = {}", l.ttl_seconds);
            println!("  grace_seconds = {}", l.grace_seconds);
            println!("  acquire_timeout_ms = {}", l.acquire_timeout_ms);
            println!("  poll_interval_ms = {}", l.poll_interval_ms);
            println!();

            println!("[doctor]");
            println!("  command = {}", opt(&toml.doctor.command));
            println!("  run_cap = {}", toml.doctor.run_cap);
            println!("  phase_cap = {}", toml.doctor.phase_cap);
            println!("  after_retries = {}", toml.doctor.after_retries);
            println!();

            println!("[builder]");
            println!("  command = {}", opt(&toml.builder.command));
            println!("  timeout_secs = {}", toml.builder.timeout_secs);
            println!();

            println!("[auditor]");
            println!("  test_command = {}", opt(&toml.auditor.test_command));
            println!("  timeout_secs = {}", toml.auditor.timeout_secs);
            println!();

            println!("[git]");
            println!("  commit_phases = {}", toml.git.commit_phases);
            println!();

            if anvil_dir.exists() {
                println!("Effective values (with env/CLI overrides):");
                let config = AnvilConfig::new(project_dir.to_path_buf())?;
                println!("  builder = {}", opt(&config.builder_cmd()));
                println!("  test_command = {}", opt(&config.test_cmd()));
                println!("  protected = {}", config.protected_paths().join(", "));
                println!();
            } else {
                println!("Run 'anvil init' to create .anvil/anvil.toml.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                AnvilToml::load(&config_path)?
            } else {
                println!("No anvil.toml found. Checking defaults.");
                AnvilToml::default()
            };
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("anvil.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !anvil_dir.exists() {
                std::fs::create_dir_all(&anvil_dir)?;
            }

            AnvilToml::default().save(&config_path)?;

            println!("Created anvil.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [builder] command, the agent that writes patches");
            println!("  - [auditor] test_command, run after each applied patch");
            println!("  - [scope] protected paths and [execution] retry limits");
            println!();
        }
    }

    Ok(())
}
