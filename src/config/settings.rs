//! Settings structures for Hybrid-BLAST configuration

use crate::backends::BackendKind;
use crate::error::ConfigError;
use crate::query::{ParameterPreset, SearchParameters, SearchProgram};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub batch: BatchSettings,
    pub cache: CacheSettings,
    pub local: LocalSettings,
    pub remote: RemoteSettings,
    pub retry: RetrySettings,
    pub scheduler: SchedulerSettings,
    pub presets: PresetSettings,
    pub defaults: QueryDefaults,
}

impl Settings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&content)?;
        Ok(settings)
    }

    /// Merge with environment variables (HYBRID_BLAST_* prefix)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("HYBRID_BLAST_LOG_LEVEL") {
            self.general.log_level = val;
        }
        if let Ok(val) = std::env::var("HYBRID_BLAST_RESULTS_DIR") {
            self.general.results_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("HYBRID_BLAST_CONCURRENCY") {
            if let Ok(concurrency) = val.parse() {
                self.batch.concurrency = concurrency;
            }
        }
        if let Ok(val) = std::env::var("HYBRID_BLAST_CACHE_DIR") {
            self.cache.directory = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("HYBRID_BLAST_LOCAL_DB") {
            self.local.database = Some(PathBuf::from(val));
            self.local.enabled = true;
        }
        if let Ok(val) = std::env::var("HYBRID_BLAST_REMOTE_URL") {
            self.remote.base_url = val;
        }
        if let Ok(val) = std::env::var("HYBRID_BLAST_EMAIL") {
            self.remote.email = Some(val);
        }
        if let Ok(val) = std::env::var("HYBRID_BLAST_API_KEY") {
            self.remote.api_key = Some(val);
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.batch.concurrency == 0 {
            return Err(ConfigError("batch.concurrency must be > 0".into()));
        }
        if self.batch.remote_concurrency == 0 {
            return Err(ConfigError("batch.remote_concurrency must be > 0".into()));
        }
        if self.remote.min_poll_interval_secs > self.remote.max_poll_interval_secs {
            return Err(ConfigError(
                "remote.min_poll_interval_secs must not exceed remote.max_poll_interval_secs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scheduler.failure_rate_threshold) {
            return Err(ConfigError(
                "scheduler.failure_rate_threshold must be within [0, 1]".into(),
            ));
        }
        if self.retry.budget == 0 {
            return Err(ConfigError("retry.budget must be at least 1".into()));
        }
        if self.local.enabled && self.local.database.is_none() {
            return Err(ConfigError("local.enabled requires local.database".into()));
        }
        if self.remote.enabled {
            url::Url::parse(&self.remote.base_url).map_err(|e| {
                ConfigError(format!(
                    "remote.base_url '{}' is not a valid URL: {}",
                    self.remote.base_url, e
                ))
            })?;
        }
        Ok(())
    }
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Where result artifacts are written
    pub results_dir: PathBuf,
    /// Default tracing filter
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            log_level: "info".to_string(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Concurrent execution slots
    pub concurrency: usize,
    /// Concurrent remote jobs, independent of the pool size
    pub remote_concurrency: usize,
    /// Time in-flight work gets to observe cancellation before it is aborted
    pub cancel_grace_secs: f64,
    /// Re-dispatch to the alternate backend once after failure
    pub fallback: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            remote_concurrency: 2,
            cancel_grace_secs: 5.0,
            fallback: true,
        }
    }
}

impl BatchSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs_f64(self.cancel_grace_secs.max(0.0))
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Directory holding one file per fingerprint (none = memory only)
    pub directory: Option<PathBuf>,
    /// Entry lifetime (none = never expires)
    pub ttl_secs: Option<u64>,
    /// Maximum entries kept in memory
    pub memory_capacity: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: dirs::cache_dir().map(|p| p.join("hybrid-blast")),
            ttl_secs: Some(86_400),
            memory_capacity: 1_000,
        }
    }
}

/// Local BLAST+ settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub enabled: bool,
    /// Database path prefix as passed to `-db`
    pub database: Option<PathBuf>,
    /// Directory containing the BLAST+ binaries (none = PATH)
    pub bin_dir: Option<PathBuf>,
    /// Hard per-search timeout
    pub timeout_secs: u64,
    /// Value for `-num_threads`
    pub num_threads: u32,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            database: None,
            bin_dir: None,
            timeout_secs: 600,
            num_threads: 4,
        }
    }
}

/// Remote BLAST service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub enabled: bool,
    /// BLAST URL API endpoint
    pub base_url: String,
    /// Identification sent with every request
    pub tool: String,
    pub email: Option<String>,
    pub api_key: Option<String>,
    /// Per-request HTTP timeout
    pub request_timeout_secs: f64,
    /// Floor for the spacing between two polls of the same job
    pub min_poll_interval_secs: f64,
    /// Ceiling for the poll spacing
    pub max_poll_interval_secs: f64,
    /// Give up on a job after this long
    pub job_timeout_secs: f64,
    /// Minimum spacing between any two requests to the service
    pub request_spacing_secs: f64,
    pub verify_ssl: bool,
    pub proxy: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://blast.ncbi.nlm.nih.gov/Blast.cgi".to_string(),
            tool: "hybrid-blast".to_string(),
            email: None,
            api_key: None,
            request_timeout_secs: 60.0,
            min_poll_interval_secs: 10.0,
            max_poll_interval_secs: 60.0,
            job_timeout_secs: 1_800.0,
            request_spacing_secs: 3.0,
            verify_ssl: true,
            proxy: None,
        }
    }
}

impl RemoteSettings {
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_poll_interval_secs.max(0.0))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_poll_interval_secs.max(self.min_poll_interval_secs).max(0.0))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.job_timeout_secs.max(0.0))
    }

    pub fn request_spacing(&self) -> Duration {
        Duration::from_secs_f64(self.request_spacing_secs.max(0.0))
    }
}

/// Retry/backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per backend, including the first one
    pub budget: u32,
    /// Delay before the first retry; doubles afterwards
    pub base_delay_secs: f64,
    /// Cap on a single backoff delay
    pub max_delay_secs: f64,
    /// Randomize each delay by up to this fraction
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            budget: 3,
            base_delay_secs: 5.0,
            max_delay_secs: 60.0,
            jitter: 0.2,
        }
    }
}

/// Scheduler thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Sequences of at most this many residues count as short
    pub short_sequence_threshold: usize,
    /// Remote failure rate above which remote work is demoted
    pub failure_rate_threshold: f64,
    /// Number of recent remote attempts considered
    pub metrics_window: usize,
    /// Attempts required before the failure rate is trusted
    pub min_samples: usize,
    /// Send everything to one backend
    pub force_backend: Option<BackendKind>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            short_sequence_threshold: 100,
            failure_rate_threshold: 0.5,
            metrics_window: 20,
            min_samples: 4,
            force_backend: None,
        }
    }
}

/// Parameter presets applied by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetSettings {
    pub short_sequence: ParameterPreset,
    pub cross_species: ParameterPreset,
}

impl Default for PresetSettings {
    fn default() -> Self {
        Self {
            short_sequence: ParameterPreset {
                evalue: Some(1000.0),
                word_size: Some(7),
                megablast: Some(false),
            },
            cross_species: ParameterPreset {
                evalue: Some(100.0),
                word_size: Some(11),
                megablast: Some(false),
            },
        }
    }
}

/// Defaults for queries read from files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    pub program: SearchProgram,
    pub database: String,
    pub parameters: SearchParameters,
    pub cross_species: bool,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            program: SearchProgram::Blastn,
            database: "nt".to_string(),
            parameters: SearchParameters::default(),
            cross_species: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.batch.concurrency, 3);
        assert!(settings.remote.enabled);
        assert!(!settings.local.enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
batch:
  concurrency: 5
local:
  enabled: true
  database: /data/blastdb/16S_ribosomal_RNA
scheduler:
  force_backend: local
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.batch.concurrency, 5);
        assert_eq!(settings.batch.remote_concurrency, 2);
        assert_eq!(settings.scheduler.force_backend, Some(BackendKind::Local));
        assert_eq!(
            settings.local.database.as_deref(),
            Some(Path::new("/data/blastdb/16S_ribosomal_RNA"))
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut settings = Settings::default();
        settings.batch.concurrency = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.remote.min_poll_interval_secs = 120.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.local.enabled = true;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.remote.base_url = "not a url".into();
        assert!(settings.validate().is_err());
        settings.remote.enabled = false;
        assert!(settings.validate().is_ok());
    }
}
