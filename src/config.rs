//! Unified configuration for Steward.
//!
//! Settings are read from `.steward/steward.toml`, then environment
//! variables, then CLI flags (file → environment → CLI). Every section is
//! optional; a missing file means defaults throughout.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [model]
//! name = "claude-sonnet-4-5"
//! context_window = 200000
//! safety_buffer = "10%"
//! max_tokens = 8192
//! claude_cmd = "claude"
//! call_timeout_secs = 600
//! input_price_per_mtok = 3.0
//! output_price_per_mtok = 15.0
//!
//! [governor]
//! max_shrink_attempts = 6
//! excerpt_keep_chars = 2000
//! summary_max_chars = 600
//!
//! [retry]
//! max_retries = 1
//! backoff_ms = 2000
//! strategy = "fixed"          # or "exponential"
//! max_backoff_ms = 30000
//!
//! [heartbeat]
//! interval_secs = 15
//! stale_after_secs = 120
//!
//! [logging]
//! level = "info"
//! format = "pretty"           # or "json"
//!
//! [plans.simple]
//! max_cost = 1.5
//!
//! [plans.medium]
//! fallback_role = ""          # no fallback
//! ```
//!
//! Environment overrides: `STEWARD_MODEL`, `CLAUDE_CMD`, `STEWARD_LOG`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::assess::{PlanOverrides, PlanTable};
use crate::context::{DEFAULT_CONTEXT_WINDOW, GovernorSettings, SafetyBuffer, parse_safety_buffer};
use crate::model::ModelPricing;
use crate::orchestrator::{BackoffPolicy, OrchestratorSettings};

pub const STEWARD_DIR: &str = ".steward";
pub const CONFIG_FILE: &str = "steward.toml";

/// Project-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Model and pricing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub name: String,
    pub context_window: usize,
    /// Percentage of the window ("10%") or an absolute token count ("4000").
    pub safety_buffer: String,
    /// Output-token cap per call.
    pub max_tokens: u64,
    /// Claude CLI command (falls back to `CLAUDE_CMD`, then "claude")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_cmd: Option<String>,
    pub call_timeout_secs: u64,
    pub input_price_per_mtok: f64,
    pub output_price_per_mtok: f64,
}

impl Default for ModelSection {
    fn default() -> Self {
        let pricing = ModelPricing::default();
        Self {
            name: OrchestratorSettings::default().model,
            context_window: DEFAULT_CONTEXT_WINDOW,
            safety_buffer: "10%".to_string(),
            max_tokens: 8_192,
            claude_cmd: None,
            call_timeout_secs: 600,
            input_price_per_mtok: pricing.input_per_mtok,
            output_price_per_mtok: pricing.output_per_mtok,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    pub max_shrink_attempts: u32,
    pub excerpt_keep_chars: usize,
    pub summary_max_chars: usize,
}

impl Default for GovernorSection {
    fn default() -> Self {
        let governor = GovernorSettings::default();
        Self {
            max_shrink_attempts: governor.max_shrink_attempts,
            excerpt_keep_chars: governor.excerpt_keep_chars,
            summary_max_chars: OrchestratorSettings::default().summary_max_chars,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub strategy: BackoffStrategy,
    /// Cap for exponential backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_ms: 2_000,
            strategy: BackoffStrategy::Fixed,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetrySection {
    pub fn backoff(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.backoff_ms);
        match self.strategy {
            BackoffStrategy::Fixed => BackoffPolicy::Fixed { delay: base },
            BackoffStrategy::Exponential => BackoffPolicy::Exponential {
                base,
                max: Duration::from_millis(self.max_backoff_ms.max(self.backoff_ms)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            stale_after_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// The complete steward.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StewardToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub governor: GovernorSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Per-complexity plan overrides
    #[serde(default)]
    pub plans: PlanOverrides,
}

impl StewardToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse steward.toml")
    }

    /// Load `<steward_dir>/steward.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(steward_dir: &Path) -> Result<Self> {
        let config_path = steward_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize steward.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Model name; `STEWARD_MODEL` overrides the file.
    pub fn model_name(&self) -> String {
        std::env::var("STEWARD_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.model.name.clone())
    }

    /// Claude command (file → env → default).
    pub fn claude_cmd(&self) -> String {
        self.model
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Log filter directive; `STEWARD_LOG` overrides the file.
    pub fn log_level(&self) -> String {
        self.log_level_for(false)
    }

    /// Like [`Self::log_level`], with `--verbose` ranking between
    /// `STEWARD_LOG` and the file.
    pub fn log_level_for(&self, verbose: bool) -> String {
        std::env::var("STEWARD_LOG")
            .ok()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| {
                if verbose {
                    "debug".to_string()
                } else {
                    self.logging.level.clone()
                }
            })
    }

    pub fn safety_buffer(&self) -> Result<SafetyBuffer> {
        Ok(parse_safety_buffer(&self.model.safety_buffer)?)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.model.call_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat.stale_after_secs)
    }

    /// Runtime settings for the orchestrator. Fails on an unusable safety buffer.
    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings> {
        let safety_buffer = self.safety_buffer()?;
        safety_buffer.limit(self.model.context_window)?;
        Ok(OrchestratorSettings {
            model: self.model_name(),
            context_window: self.model.context_window,
            max_output_tokens: self.model.max_tokens,
            safety_buffer,
            governor: GovernorSettings {
                max_shrink_attempts: self.governor.max_shrink_attempts,
                excerpt_keep_chars: self.governor.excerpt_keep_chars,
            },
            pricing: ModelPricing {
                input_per_mtok: self.model.input_price_per_mtok,
                output_per_mtok: self.model.output_price_per_mtok,
            },
            max_retries: self.retry.max_retries,
            backoff: self.retry.backoff(),
            heartbeat_interval: Duration::from_secs(self.heartbeat.interval_secs.max(1)),
            summary_max_chars: self.governor.summary_max_chars,
        })
    }

    pub fn plan_table(&self) -> PlanTable {
        PlanTable::from_overrides(&self.plans)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self, known_roles: &[&str]) -> Vec<String> {
        let mut warnings = Vec::new();

        match self.safety_buffer() {
            Ok(buffer) => {
                if let Err(e) = buffer.limit(self.model.context_window) {
                    warnings.push(e.to_string());
                }
            }
            Err(e) => warnings.push(e.to_string()),
        }
        if self.model.max_tokens == 0 {
            warnings.push("model.max_tokens must be greater than 0".to_string());
        }
        if self.model.call_timeout_secs == 0 {
            warnings.push("model.call_timeout_secs must be greater than 0".to_string());
        }
        for (name, price) in [
            ("input_price_per_mtok", self.model.input_price_per_mtok),
            ("output_price_per_mtok", self.model.output_price_per_mtok),
        ] {
            if !price.is_finite() || price < 0.0 {
                warnings.push(format!("model.{} must be a non-negative number", name));
            }
        }
        if self.governor.max_shrink_attempts == 0 {
            warnings.push(
                "governor.max_shrink_attempts is 0: any prompt over the limit is skipped"
                    .to_string(),
            );
        }
        if self.heartbeat.stale_after_secs <= self.heartbeat.interval_secs {
            warnings.push(format!(
                "heartbeat.stale_after_secs ({}) should exceed interval_secs ({})",
                self.heartbeat.stale_after_secs, self.heartbeat.interval_secs
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings.extend(self.plan_table().validate(known_roles));
        warnings
    }
}

/// Configuration bound to a project directory.
#[derive(Debug, Clone)]
pub struct StewardConfig {
    pub project_dir: PathBuf,
    pub steward_dir: PathBuf,
    pub toml: StewardToml,
}

impl StewardConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let steward_dir = project_dir.join(STEWARD_DIR);
        let toml = StewardToml::load_or_default(&steward_dir)?;

        Ok(Self {
            project_dir,
            steward_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.steward_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.steward_dir.join("steward.db")
    }

    pub fn items_dir(&self) -> PathBuf {
        self.steward_dir.join("items")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.steward_dir.join("artifacts")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.steward_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.items_dir(), self.artifacts_dir(), self.log_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
