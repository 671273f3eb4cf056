//! Project initialization (`anvil init`).

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use anvil::init::{init_project, is_initialized};

    let was_initialized = is_initialized(project_dir);

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized anvil project at {}",
            result.anvil_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .anvil/");
        println!("  ├── anvil.toml    # Configuration (use `anvil config show`)");
        println!("  ├── hints.json    # Learned hints, read-only during runs");
        println!("  ├── leases/       # Run and workspace leases");
        println!("  ├── logs/         # JSON logs, rotated daily");
        println!("  └── attempts/     # Per-attempt requests, responses and patches");
        println!();
        println!("Next steps:");
        println!("  1. Set [builder] command in .anvil/anvil.toml");
        println!("  2. Write a plan file with tiers of phases");
        println!("  3. Run `anvil run --plan <file>` to start execution");
    } else if was_initialized {
        println!(
            "Anvil project already initialized at {}",
            result.anvil_dir.display()
        );
        println!("Directory structure verified.");
    } else {
        println!(
            "Completed anvil initialization at {}",
            result.anvil_dir.display()
        );
    }

    Ok(())
}
