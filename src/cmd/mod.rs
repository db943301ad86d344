//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                   |
//! |-----------|------------------------------------|
//! | `project` | `Init`, `Assess`                   |
//! | `run`     | `Run`, `Resume`, `Cancel`          |
//! | `audit`   | `Status`, `Calls`, `Compare`       |
//! | `config`  | `Config`                           |

pub mod audit;
pub mod config;
pub mod project;
pub mod run;

pub use audit::{cmd_calls, cmd_compare, cmd_status};
pub use config::cmd_config;
pub use project::{cmd_assess, cmd_init};
pub use run::{cmd_cancel, cmd_resume, cmd_run};

use anyhow::Result;
use steward::config::StewardConfig;
use steward::store::DbHandle;

/// Open the project database, refusing to create one outside an initialized project.
pub fn open_db(config: &StewardConfig) -> Result<DbHandle> {
    if !config.steward_dir.exists() {
        anyhow::bail!("Project not initialized. Run 'steward init' first.");
    }
    DbHandle::open(&config.db_path())
}

/// Print `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
