//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML as an ordered list of steps, each backed
//! by an external command that speaks the step protocol (see
//! `adapters::command`).

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::governor::CallGovernor;
use super::registry::StepRegistry;
use crate::adapters::CommandStep;
use crate::domain::checkpoint::is_valid_key_part;

/// The eight stages of a job-search run, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    ParseResume,
    ParsePreferences,
    DiscoverCompanies,
    ScrapePostings,
    Normalize,
    Score,
    Aggregate,
    Notify,
}

impl JobStage {
    pub const ALL: [JobStage; 8] = [
        JobStage::ParseResume,
        JobStage::ParsePreferences,
        JobStage::DiscoverCompanies,
        JobStage::ScrapePostings,
        JobStage::Normalize,
        JobStage::Score,
        JobStage::Aggregate,
        JobStage::Notify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::ParseResume => "parse_resume",
            JobStage::ParsePreferences => "parse_preferences",
            JobStage::DiscoverCompanies => "discover_companies",
            JobStage::ScrapePostings => "scrape_postings",
            JobStage::Normalize => "normalize",
            JobStage::Score => "score",
            JobStage::Aggregate => "aggregate",
            JobStage::Notify => "notify",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == name)
    }
}

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI and recorded in run config)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered list of steps to execute
    pub steps: Vec<StepSpec>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if !is_valid_key_part(&step.name) {
                anyhow::bail!("Step {} has an invalid name '{}'", i, step.name);
            }
            if !seen.insert(step.name.as_str()) {
                anyhow::bail!("Step name '{}' is used more than once", step.name);
            }
            if step.command.trim().is_empty() {
                anyhow::bail!("Step '{}' has an empty command", step.name);
            }
            if step.timeout_seconds == Some(0) {
                anyhow::bail!("Step '{}' has a zero timeout", step.name);
            }
        }

        Ok(())
    }

    /// Deviations from the canonical job-search stage order.
    ///
    /// Only stages named after a `JobStage` are checked; other step names
    /// are ignored.
    pub fn job_search_order_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let stages: Vec<JobStage> = self
            .steps
            .iter()
            .filter_map(|s| JobStage::from_name(&s.name))
            .collect();

        if stages.is_empty() {
            return warnings;
        }

        for pair in stages.windows(2) {
            if pair[0] as usize > pair[1] as usize {
                warnings.push(format!(
                    "Stage '{}' runs after '{}'",
                    pair[1].as_str(),
                    pair[0].as_str()
                ));
            }
        }

        for stage in JobStage::ALL {
            if !stages.contains(&stage) {
                warnings.push(format!("Stage '{}' is missing", stage.as_str()));
            }
        }

        warnings
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Build the step registry, one CommandStep per step
    pub fn to_registry(&self, governor: Arc<CallGovernor>) -> Result<StepRegistry> {
        self.validate()?;

        for warning in self.job_search_order_warnings() {
            warn!(pipeline = %self.name, "{}", warning);
        }

        let registry = self.steps.iter().fold(StepRegistry::new(), |registry, spec| {
            registry.register(
                spec.name.clone(),
                CommandStep::new(spec.clone(), Arc::clone(&governor)),
            )
        });

        Ok(registry)
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name (unique within pipeline; also its output slot)
    pub name: String,

    /// Program to run
    pub command: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Retry policy for failed invocations
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Override timeout for this step (uses the run's step timeout if not set)
    pub timeout_seconds: Option<u64>,
}

impl StepSpec {
    /// Get the timeout override for this step
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// Bounded retry policy for metered or external calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (backoff minimum)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds (backoff maximum)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or attempts run out.
    ///
    /// The final error is returned as-is, not wrapped.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TEST_PIPELINE_YAML: &str = r#"
name: job_search
description: Weekly job search

steps:
  - name: parse_resume
    command: ./steps/parse_resume.py

  - name: scrape_postings
    command: ./steps/scrape.py
    args: ["--headless"]
    timeout_seconds: 900
    retry_policy:
      max_attempts: 2
"#;

    #[test]
    fn test_pipeline_parsing() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();

        assert_eq!(pipeline.name, "job_search");
        assert_eq!(pipeline.steps.len(), 2);

        let scrape = pipeline.get_step("scrape_postings").unwrap();
        assert_eq!(scrape.args, vec!["--headless"]);
        assert_eq!(scrape.timeout(), Some(Duration::from_secs(900)));
        assert_eq!(scrape.retry_policy.max_attempts, 2);
        assert_eq!(scrape.retry_policy.initial_delay_ms, 1000);
    }

    #[test]
    fn test_pipeline_validation() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let yaml = r#"
name: dup
steps:
  - name: score
    command: a
  - name: score
    command: b
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_stage_order_warnings() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        let warnings = pipeline.job_search_order_warnings();

        // Two of eight stages present, in order
        assert_eq!(warnings.len(), 6);
        assert!(warnings.iter().all(|w| w.ends_with("is missing")));

        let reversed = Pipeline {
            steps: pipeline.steps.iter().rev().cloned().collect(),
            ..pipeline.clone()
        };
        assert!(reversed
            .job_search_order_warnings()
            .contains(&"Stage 'parse_resume' runs after 'scrape_postings'".to_string()));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[tokio::test]
    async fn test_retry_returns_final_error_unwrapped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("attempt {} failed", attempt)) }
            })
            .await;

        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let policy = RetryPolicy {
            initial_delay_ms: 1,
            ..Default::default()
        };

        let result: Result<u32, String> = policy
            .retry(|attempt| async move {
                if attempt < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result, Ok(2));
    }
}
