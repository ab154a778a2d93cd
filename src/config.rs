//! Configuration for jobscout.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (JOBSCOUT_HOME, JOBSCOUT_BUDGET_USD)
//! 2. Config file (.jobscout/config.yaml)
//! 3. Defaults (~/.jobscout, $5.00 budget)
//!
//! Config file discovery:
//! - Searches current directory and parents for .jobscout/config.yaml
//! - Paths in config file are relative to the .jobscout/ directory

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::checkpoint_store::{CheckpointStore, FileCheckpointStore};
use crate::core::governor::{CallGovernor, PriceTable};
use crate::core::sqlite_store::SqliteCheckpointStore;
use crate::domain::{BudgetLimits, RunConfig, RunLimits};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub budget: BudgetLimits,
    #[serde(default)]
    pub limits: RunLimits,
    /// Extra or overriding unit prices, merged over the standard table
    #[serde(default)]
    pub prices: PriceTable,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .jobscout/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Checkpoint directory or database file (relative to .jobscout/)
    pub dir: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: CheckpointBackend::default(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// One JSON file per checkpoint
    #[default]
    File,
    /// Single SQLite database
    Sqlite,
}

/// Resolved checkpoint settings
#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub enabled: bool,
    pub backend: CheckpointBackend,
    /// Directory (file backend) or database path (sqlite backend)
    pub location: PathBuf,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to jobscout home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub checkpoint: CheckpointSettings,
    /// Default budget for new runs
    pub budget: BudgetLimits,
    /// Default deadlines and concurrency for new runs
    pub limits: RunLimits,
    pub prices: PriceTable,
}

impl ResolvedConfig {
    /// Runs directory ($JOBSCOUT_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Run configuration seeded with the configured defaults
    pub fn run_config(&self, run_id: impl Into<String>) -> RunConfig {
        RunConfig::new(run_id)
            .with_budget(self.budget)
            .with_limits(self.limits)
    }

    /// Call governor using the configured price table
    pub fn governor(&self) -> CallGovernor {
        CallGovernor::new(self.prices.clone())
    }

    /// Open the configured checkpoint backend (None when disabled)
    pub fn open_checkpoint_store(&self) -> Result<Option<Arc<dyn CheckpointStore>>> {
        if !self.checkpoint.enabled {
            return Ok(None);
        }

        let store: Arc<dyn CheckpointStore> = match self.checkpoint.backend {
            CheckpointBackend::File => {
                Arc::new(FileCheckpointStore::new(self.checkpoint.location.clone()))
            }
            CheckpointBackend::Sqlite => {
                if let Some(parent) = self.checkpoint.location.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
                Arc::new(SqliteCheckpointStore::open(&self.checkpoint.location)?)
            }
        };

        Ok(Some(store))
    }
}

/// Check budget and limit settings for consistency
pub fn validate_settings(budget: &BudgetLimits, limits: &RunLimits) -> Result<()> {
    if budget.hard_limit_usd.is_nan() || budget.hard_limit_usd < 0.0 {
        anyhow::bail!("Budget hard limit must be a non-negative amount");
    }
    if budget.warn_limit_usd > budget.hard_limit_usd {
        anyhow::bail!(
            "Budget warning limit (${:.2}) exceeds hard limit (${:.2})",
            budget.warn_limit_usd,
            budget.hard_limit_usd
        );
    }
    if limits.concurrency < 1 {
        anyhow::bail!("Concurrency must be at least 1");
    }
    if limits.step_timeout_seconds == 0 || limits.unit_timeout_seconds == 0 {
        anyhow::bail!("Timeouts must be greater than zero");
    }

    Ok(())
}

/// Reject price entries that would let accrued cost go down
pub fn validate_prices(prices: &PriceTable) -> Result<()> {
    let invalid = prices.invalid_kinds();
    if !invalid.is_empty() {
        anyhow::bail!(
            "Prices must be finite and non-negative: {}",
            invalid.join(", ")
        );
    }
    Ok(())
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".jobscout").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Values read from the environment
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    budget_usd: Option<f64>,
}

impl EnvOverrides {
    fn from_env() -> Result<Self> {
        let home = std::env::var("JOBSCOUT_HOME").ok().map(PathBuf::from);
        let budget_usd = match std::env::var("JOBSCOUT_BUDGET_USD") {
            Ok(value) => Some(
                value
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("Invalid JOBSCOUT_BUDGET_USD: {}", value))?,
            ),
            Err(_) => None,
        };

        Ok(Self { home, budget_usd })
    }
}

/// Merge file, environment and defaults
fn resolve(
    config_file: Option<PathBuf>,
    file: Option<ConfigFile>,
    env: EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let file_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = match (&env.home, file.as_ref().and_then(|f| f.paths.home.as_deref())) {
        (Some(env_home), _) => env_home.clone(),
        (None, Some(home_path)) => resolve_path(&file_dir, home_path),
        (None, None) => default_home,
    };

    let file = file.unwrap_or_else(|| ConfigFile {
        version: default_version(),
        paths: PathsConfig::default(),
        checkpoint: CheckpointConfig::default(),
        budget: BudgetLimits::default(),
        limits: RunLimits::default(),
        prices: PriceTable::default(),
    });

    let location = match (&file.checkpoint.dir, file.checkpoint.backend) {
        (Some(dir), _) => resolve_path(&file_dir, dir),
        (None, CheckpointBackend::File) => home.join("checkpoints"),
        (None, CheckpointBackend::Sqlite) => home.join("checkpoints.db"),
    };

    let budget = match env.budget_usd {
        Some(ceiling) => BudgetLimits::with_ceiling(ceiling),
        None => file.budget,
    };

    validate_settings(&budget, &file.limits)?;

    let mut prices = PriceTable::standard();
    prices.merge(file.prices);
    validate_prices(&prices)?;

    Ok(ResolvedConfig {
        home,
        config_file,
        checkpoint: CheckpointSettings {
            enabled: file.checkpoint.enabled,
            backend: file.checkpoint.backend,
            location,
        },
        budget,
        limits: file.limits,
        prices,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".jobscout");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };

    resolve(config_file, file, EnvOverrides::from_env()?, default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the jobscout home directory (engine state)
pub fn jobscout_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($JOBSCOUT_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::governor::{UnitPrice, Usage};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, yaml: &str) -> PathBuf {
        let config_dir = temp.path().join(".jobscout");
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(
            None,
            None,
            EnvOverrides::default(),
            PathBuf::from("/home/test/.jobscout"),
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/home/test/.jobscout"));
        assert!(config.checkpoint.enabled);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
        assert_eq!(
            config.checkpoint.location,
            PathBuf::from("/home/test/.jobscout/checkpoints")
        );
        assert_eq!(config.budget, BudgetLimits::default());
        assert!(!config.prices.is_empty());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1"
checkpoint:
  backend: sqlite
  dir: ./state/checkpoints.db
budget:
  hard_limit_usd: 2.0
  warn_limit_usd: 1.5
limits:
  concurrency: 3
prices:
  local-llm:
    input_per_1k: 0.0
    output_per_1k: 0.0
  gpt-4o:
    input_per_1k: 0.005
    output_per_1k: 0.015
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.checkpoint.backend, CheckpointBackend::Sqlite);
        assert_eq!(file.limits.concurrency, 3);
        assert_eq!(file.limits.step_timeout_seconds, 300);

        let config = resolve(
            Some(config_path.clone()),
            Some(file),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(config.budget.hard_limit_usd, 2.0);
        assert_eq!(
            config.checkpoint.location,
            temp.path().join(".jobscout").join("./state/checkpoints.db")
        );
        // File prices override the standard table
        assert_eq!(config.prices.get("gpt-4o"), Some(&UnitPrice::new(0.005, 0.015)));
        assert!(config.prices.get("local-llm").is_some());
        assert!(config.prices.get("gpt-4o-mini").is_some());
    }

    #[test]
    fn test_env_overrides_win() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "budget:\n  hard_limit_usd: 2.0\n  warn_limit_usd: 1.0");
        let file = load_config_file(&config_path).unwrap();

        let config = resolve(
            Some(config_path),
            Some(file),
            EnvOverrides {
                home: Some(PathBuf::from("/srv/jobscout")),
                budget_usd: Some(10.0),
            },
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/jobscout"));
        assert_eq!(config.runs_dir(), PathBuf::from("/srv/jobscout/runs"));
        assert_eq!(config.budget.hard_limit_usd, 10.0);
        assert_eq!(config.budget.warn_limit_usd, 8.0);
    }

    #[test]
    fn test_validation() {
        let limits = RunLimits::default();
        assert!(validate_settings(&BudgetLimits::default(), &limits).is_ok());

        let inverted = BudgetLimits {
            hard_limit_usd: 1.0,
            warn_limit_usd: 2.0,
        };
        assert!(validate_settings(&inverted, &limits).is_err());

        let no_workers = RunLimits {
            concurrency: 0,
            ..RunLimits::default()
        };
        assert!(validate_settings(&BudgetLimits::default(), &no_workers).is_err());

        let no_deadline = RunLimits {
            step_timeout_seconds: 0,
            ..RunLimits::default()
        };
        assert!(validate_settings(&BudgetLimits::default(), &no_deadline).is_err());
    }

    #[test]
    fn test_negative_price_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
prices:
  discount-model:
    input_per_1k: -0.5
    output_per_1k: 0.1
"#,
        );
        let file = load_config_file(&config_path).unwrap();

        let err = resolve(
            Some(config_path),
            Some(file),
            EnvOverrides::default(),
            temp.path().join("home"),
        )
        .unwrap_err();

        assert!(err.to_string().contains("discount-model"));
        assert!(validate_prices(&PriceTable::standard()).is_ok());
        assert!(validate_prices(
            &PriceTable::new().with_price("nan", UnitPrice::new(f64::NAN, 0.0))
        )
        .is_err());
    }

    #[test]
    fn test_run_config_and_governor_use_settings() {
        let config = resolve(
            None,
            None,
            EnvOverrides {
                home: None,
                budget_usd: Some(1.0),
            },
            PathBuf::from("/home/test/.jobscout"),
        )
        .unwrap();

        let run = config.run_config("run-7");
        assert_eq!(run.run_id, "run-7");
        assert_eq!(run.budget.hard_limit_usd, 1.0);

        let governor = config.governor();
        assert!(governor.prices().cost(&Usage::new("gpt-4o", 1000, 0)) > 0.0);
    }

    #[tokio::test]
    async fn test_disabled_checkpoints_open_nothing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "checkpoint:\n  enabled: false");
        let file = load_config_file(&config_path).unwrap();

        let config = resolve(
            Some(config_path),
            Some(file),
            EnvOverrides::default(),
            temp.path().to_path_buf(),
        )
        .unwrap();

        assert!(config.open_checkpoint_store().unwrap().is_none());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.jobscout");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.jobscout/./state")
        );
    }
}
