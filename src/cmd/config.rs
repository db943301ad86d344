//! Configuration view and validation commands - `steward config`.

use anyhow::Result;
use steward_common::ComplexityClass;

use steward::config::{StewardConfig, StewardToml};
use steward::orchestrator::RoleRegistry;

use super::super::ConfigCommands;

pub fn cmd_config(config: &StewardConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Steward Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No steward.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();

            println!("Effective values (with env overrides):");
            println!("  model = \"{}\"", config.toml.model_name());
            println!("  claude_cmd = \"{}\"", config.toml.claude_cmd());
            println!("  log level = \"{}\"", config.toml.log_level());
            println!();

            println!("Plans:");
            let plans = config.toml.plan_table();
            for class in ComplexityClass::all() {
                let plan = plans.plan_for(class);
                println!(
                    "  {:<8} {:<28} {:>4} msgs  ${:<7.2} {:>8} tokens  {:>5}s",
                    class.as_str(),
                    plan.roles.join(">"),
                    plan.max_messages,
                    plan.max_cost,
                    plan.max_tokens,
                    plan.max_duration_secs
                );
            }
            println!();
            if !config_path.exists() {
                println!("Run 'steward config init' to create a steward.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No steward.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = StewardToml::load(&config_path)?;
            let registry = RoleRegistry::builtin();
            let warnings = toml.validate(&registry.ids());

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
                println!("steward.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.steward_dir)?;
            StewardToml::default().save(&config_path)?;

            println!("Created steward.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [model] name, context_window, safety_buffer, prices");
            println!("  - [retry] max_retries, backoff_ms, strategy");
            println!("  - [plans.simple|medium|complex] roles and budget ceilings");
            println!();
        }
    }

    Ok(())
}
