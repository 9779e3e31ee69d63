//! Review configuration: schema, file + environment loading, fingerprinting
//!
//! Loading hierarchy: env > file > defaults.

use crate::error::{ReviewError, ReviewResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Publication date window applied to database searches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
}

/// Immutable description of what the review is about.
///
/// Fixed for the life of a run; snapshotted into every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicContext {
    pub topic: String,
    #[serde(default)]
    pub research_question: String,
    #[serde(default)]
    pub inclusion_criteria: Vec<String>,
    #[serde(default)]
    pub exclusion_criteria: Vec<String>,
    #[serde(default)]
    pub date_range: DateRange,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl TopicContext {
    /// Normalized form used for resume discovery matching.
    pub fn normalized_topic(&self) -> String {
        self.topic.trim().to_lowercase()
    }
}

/// Which model tier each pipeline role uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRoles {
    #[serde(default = "default_screening_model")]
    pub screening: String,
    #[serde(default = "default_extraction_model")]
    pub extraction: String,
    #[serde(default = "default_extraction_model")]
    pub writing: String,
}

fn default_screening_model() -> String {
    "flash".to_string()
}

fn default_extraction_model() -> String {
    "pro".to_string()
}

impl Default for ModelRoles {
    fn default() -> Self {
        Self {
            screening: default_screening_model(),
            extraction: default_extraction_model(),
            writing: default_extraction_model(),
        }
    }
}

fn default_model_tiers() -> BTreeMap<String, u32> {
    let mut tiers = BTreeMap::new();
    tiers.insert("flash-lite".to_string(), 10);
    tiers.insert("flash".to_string(), 10);
    tiers.insert("pro".to_string(), 5);
    tiers
}

/// Retry knobs for transient external failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

/// Circuit breaker thresholds for external services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_breaker_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_breaker_timeout_secs() -> u64 {
    60
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_breaker_timeout_secs(),
        }
    }
}

/// Per-call timeouts for external I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_secs: u64,
    #[serde(default = "default_pdf_timeout_secs")]
    pub pdf_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_secs: u64,
}

fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_pdf_timeout_secs() -> u64 {
    45
}
fn default_search_timeout_secs() -> u64 {
    20
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            llm_secs: default_llm_timeout_secs(),
            pdf_secs: default_pdf_timeout_secs(),
            search_secs: default_search_timeout_secs(),
        }
    }
}

/// Reliability gate configuration (evaluated pre-export).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    /// Strict mode turns any failing gate into a fatal error
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_invalid_citation_ratio")]
    pub max_invalid_citation_ratio: f64,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
}

fn default_invalid_citation_ratio() -> f64 {
    0.01
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            strict: false,
            max_invalid_citation_ratio: default_invalid_citation_ratio(),
            max_cost_usd: None,
        }
    }
}

fn default_run_root() -> PathBuf {
    PathBuf::from("data/runs")
}
fn default_max_results_per_db() -> usize {
    50
}
fn default_max_concurrency() -> usize {
    8
}
fn default_fulltext_max_chars() -> usize {
    40_000
}
fn default_heartbeat_secs() -> u64 {
    60
}

/// Effective configuration for one review run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub context: TopicContext,
    /// Search provider names, queried in order
    pub databases: Vec<String>,
    #[serde(default = "default_max_results_per_db")]
    pub max_results_per_db: usize,
    #[serde(default)]
    pub models: ModelRoles,
    /// Model tier name -> requests per minute
    #[serde(default = "default_model_tiers")]
    pub model_tiers: BTreeMap<String, u32>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub gates: GateSettings,
    #[serde(default = "default_run_root")]
    pub run_root: PathBuf,
    /// Whether to look for a resumable run before starting fresh
    #[serde(default = "default_true")]
    pub resume: bool,
    /// Resume a specific run instead of discovering one by topic
    #[serde(default)]
    pub resume_run_id: Option<String>,
    /// Skip phases with an ordinal below this value
    #[serde(default)]
    pub start_from: Option<u32>,
    /// Bound on parallel per-paper work within a phase
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_fulltext_max_chars")]
    pub fulltext_max_chars: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl ReviewConfig {
    /// Minimal config for a topic, everything else defaulted.
    pub fn for_topic(topic: &str, databases: Vec<String>) -> Self {
        Self {
            context: TopicContext {
                topic: topic.to_string(),
                ..TopicContext::default()
            },
            databases,
            max_results_per_db: default_max_results_per_db(),
            models: ModelRoles::default(),
            model_tiers: default_model_tiers(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            timeouts: TimeoutSettings::default(),
            gates: GateSettings::default(),
            run_root: default_run_root(),
            resume: true,
            resume_run_id: None,
            start_from: None,
            max_concurrency: default_max_concurrency(),
            fulltext_max_chars: default_fulltext_max_chars(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }

    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load(path: &Path) -> ReviewResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReviewError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: ReviewConfig = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `RUN_ROOT` and `REVFLOW_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("RUN_ROOT") {
            if !root.is_empty() {
                self.run_root = PathBuf::from(root);
            }
        }
        if let Ok(v) = std::env::var("REVFLOW_RESUME") {
            self.resume = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Ok(v) = std::env::var("REVFLOW_STRICT_GATES") {
            self.gates.strict = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("REVFLOW_START_FROM") {
            if let Ok(n) = v.parse() {
                self.start_from = Some(n);
            }
        }
    }

    /// Validate values that serde cannot reject on its own.
    pub fn validate(&self) -> ReviewResult<()> {
        if self.context.topic.trim().is_empty() {
            return Err(ReviewError::Config("topic must not be empty".to_string()));
        }
        if self.databases.is_empty() {
            return Err(ReviewError::Config(
                "at least one database must be configured".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ReviewError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ReviewError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic hash over the canonical form of the effective
    /// configuration. Two runs with the same topic and fingerprint are
    /// resumable into one another.
    pub fn fingerprint(&self) -> String {
        // BTreeMap and sorted vectors keep the canonical form stable
        // regardless of declaration order in the config file.
        let mut databases = self.databases.clone();
        databases.sort();
        let canonical = serde_json::json!({
            "topic": self.context.normalized_topic(),
            "research_question": self.context.research_question,
            "inclusion_criteria": self.context.inclusion_criteria,
            "exclusion_criteria": self.context.exclusion_criteria,
            "date_range": self.context.date_range,
            "keywords": self.context.keywords,
            "databases": databases,
            "max_results_per_db": self.max_results_per_db,
            "models": self.models,
            "model_tiers": self.model_tiers,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = ReviewConfig::for_topic("T1", vec!["a".to_string(), "b".to_string()]);
        let b = ReviewConfig::for_topic("T1", vec!["b".to_string(), "a".to_string()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_topic() {
        let a = ReviewConfig::for_topic("T1", vec!["a".to_string()]);
        let b = ReviewConfig::for_topic("T2", vec!["a".to_string()]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_model_tiers() {
        let a = ReviewConfig::for_topic("T1", vec!["a".to_string()]);
        let mut b = a.clone();
        b.model_tiers.insert("pro".to_string(), 20);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn empty_topic_rejected() {
        let config = ReviewConfig::for_topic("  ", vec!["a".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_defaults_fill_in() {
        let yaml = r#"
context:
  topic: "robot learning"
databases: ["openalex"]
"#;
        let config: ReviewConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_results_per_db, 50);
        assert_eq!(config.timeouts.llm_secs, 120);
        assert!(config.resume);
    }
}
