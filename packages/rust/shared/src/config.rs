//! Application configuration for ledgerflow.
//!
//! User config lives at `~/.ledgerflow/ledgerflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ledgerflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ledgerflow";

// ---------------------------------------------------------------------------
// Config structs (matching ledgerflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Object store location and bucket names.
    #[serde(default)]
    pub objects: ObjectsConfig,

    /// Ledger connection settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Raw-input discovery rules.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// External transform/scoring collaborators.
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,

    /// Drift monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Execution driver settings.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Batch-level change detection.
    #[serde(default)]
    pub batch: BatchConfig,
}

/// `[objects]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectsConfig {
    /// Root directory of the filesystem object store.
    #[serde(default = "default_objects_root")]
    pub root: String,

    /// Bucket holding raw inputs and every derived artifact.
    #[serde(default = "default_data_bucket")]
    pub data_bucket: String,

    /// Key prefix listed by the ingest stage (empty = whole bucket).
    #[serde(default)]
    pub raw_prefix: String,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            root: default_objects_root(),
            data_bucket: default_data_bucket(),
            raw_prefix: String::new(),
        }
    }
}

fn default_objects_root() -> String {
    "var/objects".into()
}
fn default_data_bucket() -> String {
    "observations".into()
}

/// `[ledger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Logical name of the credential holding the ledger connection.
    #[serde(default = "default_secret_name")]
    pub secret_name: String,

    /// Local database used when no credential is published under `secret_name`.
    #[serde(default = "default_ledger_path")]
    pub default_path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            secret_name: default_secret_name(),
            default_path: default_ledger_path(),
        }
    }
}

fn default_secret_name() -> String {
    "LEDGER_CONN".into()
}
fn default_ledger_path() -> String {
    "var/ledger/ledgerflow.db".into()
}

/// `[ingest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Regexes of object keys never treated as raw input.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "/$".into(),
        "processed".into(),
        r"(^|/)predictions_[^/]*\.parquet$".into(),
        r"^reference_data\.parquet$".into(),
    ]
}

/// `[collaborators]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    /// Command launching the bridge processes (e.g. `python3`).
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Script implementing feature derivation.
    #[serde(default = "default_transform_script")]
    pub transform_script: String,

    /// Script implementing model scoring.
    #[serde(default = "default_score_script")]
    pub score_script: String,

    /// Working directory for bridge subprocesses.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            bridge_cmd: default_bridge_cmd(),
            transform_script: default_transform_script(),
            score_script: default_score_script(),
            working_dir: default_working_dir(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "python3".into()
}
fn default_transform_script() -> String {
    "bridges/transform.py".into()
}
fn default_score_script() -> String {
    "bridges/score.py".into()
}
fn default_working_dir() -> String {
    ".".into()
}

/// Statistical distance used for the drift score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftMethod {
    /// Jensen-Shannon distance (base 2), bounded in `[0, 1]`.
    #[default]
    JensenShannon,
    /// Chi-square goodness-of-fit p-value, bounded in `[0, 1]`.
    ChiSquare,
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Key of the reference predictions in the data bucket.
    #[serde(default = "default_reference_key")]
    pub reference_key: String,

    /// Drift statistic.
    #[serde(default)]
    pub drift_method: DriftMethod,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reference_key: default_reference_key(),
            drift_method: DriftMethod::default(),
        }
    }
}

fn default_reference_key() -> String {
    "reference_data.parquet".into()
}

/// `[driver]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Logical name of the workflow to drive.
    #[serde(default = "default_workflow_name")]
    pub workflow_name: String,

    /// Base URL of a remote orchestrator. Unset = run the local engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Delay between status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum number of status polls before giving up locally.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Multiplier applied to the interval after each poll (1.0 = fixed).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for the backed-off interval.
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            workflow_name: default_workflow_name(),
            endpoint: None,
            poll_interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
            backoff_factor: default_backoff_factor(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

fn default_workflow_name() -> String {
    "observation-pipeline".into()
}
fn default_poll_interval() -> u64 {
    2000
}
fn default_max_attempts() -> u32 {
    900
}
fn default_backoff_factor() -> f64 {
    1.0
}
fn default_max_poll_interval() -> u64 {
    30_000
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Side file storing name → digest for the batch detector.
    #[serde(default = "default_hash_file")]
    pub hash_file: String,

    /// Only files starting with this prefix belong to a batch.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            hash_file: default_hash_file(),
            file_prefix: default_file_prefix(),
        }
    }
}

fn default_hash_file() -> String {
    "data_hashes.json".into()
}
fn default_file_prefix() -> String {
    "part".into()
}

// ---------------------------------------------------------------------------
// Poll policy (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime polling policy for the execution driver.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Initial delay between status polls.
    pub interval: Duration,
    /// Maximum number of polls before the local wait gives up.
    pub max_attempts: u32,
    /// Growth factor applied after every poll.
    pub backoff_factor: f64,
    /// Ceiling for the grown interval.
    pub max_interval: Duration,
}

impl PollPolicy {
    /// Fixed-interval policy with the given attempt budget.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff_factor: 1.0,
            max_interval: interval,
        }
    }

    /// Delay to wait before poll number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.interval.as_millis() as f64 * factor.powi(exp);
        let capped = millis.min(self.max_interval.max(self.interval).as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl From<&AppConfig> for PollPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.driver.poll_interval_ms),
            max_attempts: config.driver.max_attempts,
            backoff_factor: config.driver.backoff_factor,
            max_interval: Duration::from_millis(config.driver.max_poll_interval_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.ledgerflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LedgerflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ledgerflow/ledgerflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LedgerflowError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        LedgerflowError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LedgerflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LedgerflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LedgerflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject values the pipeline cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.objects.data_bucket.trim().is_empty() {
        return Err(LedgerflowError::config("objects.data_bucket must not be empty"));
    }
    if config.driver.poll_interval_ms == 0 {
        return Err(LedgerflowError::config("driver.poll_interval_ms must be positive"));
    }
    if config.driver.max_attempts == 0 {
        return Err(LedgerflowError::config("driver.max_attempts must be positive"));
    }
    if !(config.driver.backoff_factor >= 1.0) {
        return Err(LedgerflowError::config("driver.backoff_factor must be >= 1.0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_bucket"));
        assert!(toml_str.contains("LEDGER_CONN"));
        assert!(toml_str.contains("jensen-shannon"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.driver.poll_interval_ms, 2000);
        assert_eq!(parsed.batch.hash_file, "data_hashes.json");
        assert_eq!(parsed.ingest.exclude_patterns.len(), 4);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[objects]
data_bucket = "droughtwatch-data"

[monitor]
drift_method = "chi-square"

[driver]
endpoint = "http://localhost:8083"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.objects.data_bucket, "droughtwatch-data");
        assert_eq!(config.objects.root, "var/objects");
        assert_eq!(config.monitor.drift_method, DriftMethod::ChiSquare);
        assert_eq!(config.driver.endpoint.as_deref(), Some("http://localhost:8083"));
        assert_eq!(config.driver.workflow_name, "observation-pipeline");
    }

    #[test]
    fn poll_policy_from_app_config() {
        let app = AppConfig::default();
        let policy = PollPolicy::from(&app);
        assert_eq!(policy.interval, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 900);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn poll_policy_backoff_is_capped() {
        let policy = PollPolicy {
            interval: Duration::from_millis(100),
            max_attempts: 10,
            backoff_factor: 2.0,
            max_interval: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.driver.poll_interval_ms = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));

        let mut config = AppConfig::default();
        config.driver.backoff_factor = 0.5;
        assert!(validate_config(&config).is_err());
    }
}
