//! Project initialization and work-item assessment.

use anyhow::Result;
use console::style;

use steward::config::{StewardConfig, StewardToml};
use steward::source::{FileWorkItemSource, WorkItemSource};
use steward::store::DbHandle;

pub fn cmd_init(config: &StewardConfig) -> Result<()> {
    let was_initialized = config.config_file().exists();

    config.ensure_directories()?;
    if !was_initialized {
        StewardToml::default().save(&config.config_file())?;
    }
    // Opening the database creates it and runs migrations.
    DbHandle::open(&config.db_path())?;

    if was_initialized {
        println!(
            "Steward project already initialized at {}",
            config.steward_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!(
        "Initialized steward project at {}",
        config.steward_dir.display()
    );
    println!();
    println!("Created directory structure:");
    println!("  .steward/");
    println!("  ├── steward.toml  # Configuration (use `steward config show`)");
    println!("  ├── steward.db    # Runs, steps, ledger and checkpoints");
    println!("  ├── items/        # Work items: <id>.md, .yaml or .json");
    println!("  ├── artifacts/    # Step output, one directory per run");
    println!("  └── logs/         # Daily rolling logs");
    println!();
    println!("Next steps:");
    println!("  1. Add a work item, e.g. .steward/items/ENG-1.md");
    println!("  2. Run `steward assess ENG-1` to see the plan it gets");
    println!("  3. Run `steward run ENG-1`");
    Ok(())
}

pub async fn cmd_assess(config: &StewardConfig, item_id: &str, json: bool) -> Result<()> {
    let source = FileWorkItemSource::new(config.items_dir());
    let item = source.fetch(item_id).await?;
    let assessment = config.toml.plan_table().assess(&item);
    if json {
        return super::print_json(&assessment);
    }

    let plan = &assessment.plan;
    println!();
    println!("{}: {}", style(&item.id).bold(), item.title);
    println!(
        "  Acceptance criteria: {}  →  {}",
        assessment.criteria_count,
        style(assessment.complexity).cyan()
    );
    println!();
    println!("Plan: {}", plan.workflow_type);
    for (i, role) in plan.roles.iter().enumerate() {
        let optional = if plan.is_optional(role) {
            " (optional)"
        } else {
            ""
        };
        println!("  {}. {}{}", i + 1, role, optional);
    }
    if let Some(fallback) = &plan.fallback_role {
        println!("  fallback: {}", fallback);
    }
    println!();
    println!("Ceilings:");
    println!("  messages  {}", plan.max_messages);
    println!("  cost      ${:.2}", plan.max_cost);
    println!("  tokens    {}", plan.max_tokens);
    println!("  duration  {}s", plan.max_duration_secs);
    println!();
    Ok(())
}
