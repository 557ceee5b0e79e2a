// src/utils/engine_config.rs

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{DedupeError, DedupeResult};
use crate::merging::RetryPolicy;

pub const DEFAULT_THRESHOLD: f64 = 0.85;
pub const DEFAULT_MAX_CONCURRENT_MERGES: usize = 4;
pub const DEFAULT_STORAGE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_STORAGE_BACKOFF_MS: u64 = 50;
pub const DEFAULT_READ_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1000;

/// What a later run does with clusters an earlier run withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectedClusterPolicy {
    /// Score them again like any other pair.
    #[default]
    Reevaluate,
    /// Skip pairs whose records were rejected together.
    Exclude,
}

impl FromStr for RejectedClusterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reevaluate" => Ok(Self::Reevaluate),
            "exclude" => Ok(Self::Exclude),
            other => Err(format!("unknown rejected-cluster policy '{}'", other)),
        }
    }
}

impl fmt::Display for RejectedClusterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reevaluate => write!(f, "reevaluate"),
            Self::Exclude => write!(f, "exclude"),
        }
    }
}

/// Per-invocation options of a normalization run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Caps both scored edges and processed clusters.
    pub limit: Option<usize>,
    pub threshold: f64,
    pub force: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            limit: None,
            threshold: DEFAULT_THRESHOLD,
            force: false,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> DedupeResult<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(DedupeError::Configuration(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.limit == Some(0) {
            return Err(DedupeError::Configuration("limit must be positive when set".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub threshold: f64,
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub force: bool,
    pub rejected_policy: RejectedClusterPolicy,
    pub max_workers: usize,
    pub max_concurrent_merges: usize,
    pub storage_max_attempts: u32,
    pub storage_backoff_ms: u64,
    pub read_batch_size: usize,
    pub max_block_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            dry_run: true,
            limit: None,
            force: false,
            rejected_policy: RejectedClusterPolicy::Reevaluate,
            max_workers: num_cpus::get(),
            max_concurrent_merges: DEFAULT_MAX_CONCURRENT_MERGES,
            storage_max_attempts: DEFAULT_STORAGE_MAX_ATTEMPTS,
            storage_backoff_ms: DEFAULT_STORAGE_BACKOFF_MS,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }
}

/// Parses an env var, falling back to `default` when unset or malformed.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid {}='{}' ({}), using default", key, raw, e);
                default
            }
        },
        Err(_) => default,
    }
}

impl EngineConfig {
    /// Create configuration from `DEDUPE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let limit = match env::var("DEDUPE_LIMIT") {
            Ok(raw) if raw.trim().is_empty() => None,
            Ok(raw) => match raw.trim().parse::<usize>() {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Invalid DEDUPE_LIMIT='{}' ({}), running without a limit", raw, e);
                    None
                }
            },
            Err(_) => None,
        };

        Self {
            threshold: env_or("DEDUPE_THRESHOLD", defaults.threshold),
            dry_run: env_or("DEDUPE_DRY_RUN", defaults.dry_run),
            limit,
            force: env_or("DEDUPE_FORCE", defaults.force),
            rejected_policy: env_or("DEDUPE_REJECTED_POLICY", defaults.rejected_policy),
            max_workers: env_or("DEDUPE_MAX_WORKERS", defaults.max_workers),
            max_concurrent_merges: env_or("DEDUPE_MAX_CONCURRENT_MERGES", defaults.max_concurrent_merges),
            storage_max_attempts: env_or("DEDUPE_STORAGE_MAX_ATTEMPTS", defaults.storage_max_attempts),
            storage_backoff_ms: env_or("DEDUPE_STORAGE_BACKOFF_MS", defaults.storage_backoff_ms),
            read_batch_size: env_or("DEDUPE_READ_BATCH_SIZE", defaults.read_batch_size),
            max_block_size: env_or("DEDUPE_MAX_BLOCK_SIZE", defaults.max_block_size),
        }
    }

    pub fn validate(&self) -> DedupeResult<()> {
        self.run_options().validate()?;
        let positive = [
            ("max_workers", self.max_workers),
            ("max_concurrent_merges", self.max_concurrent_merges),
            ("storage_max_attempts", self.storage_max_attempts as usize),
            ("read_batch_size", self.read_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DedupeError::Configuration(format!("{} must be at least 1", name)));
            }
        }
        if self.max_block_size < 2 {
            return Err(DedupeError::Configuration(
                "max_block_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            limit: self.limit,
            threshold: self.threshold,
            force: self.force,
        }
    }

    /// Same engine settings with the per-run options replaced.
    pub fn with_run_options(mut self, options: &RunOptions) -> Self {
        self.dry_run = options.dry_run;
        self.limit = options.limit;
        self.threshold = options.threshold;
        self.force = options.force;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.storage_max_attempts, Duration::from_millis(self.storage_backoff_ms))
    }

    pub fn log_config(&self) {
        info!("⚙️ Dedupe engine configuration");
        info!(
            "   Threshold: {:.2} | Dry-run: {} | Force: {} | Limit: {}",
            self.threshold,
            self.dry_run,
            self.force,
            self.limit.map_or_else(|| "none".to_string(), |l| l.to_string())
        );
        info!("   Rejected clusters: {}", self.rejected_policy);
        info!(
            "   Workers: {} | Concurrent merges: {} | Read batch: {} | Max block: {}",
            self.max_workers, self.max_concurrent_merges, self.read_batch_size, self.max_block_size
        );
        info!(
            "   Storage retries: {} attempts, {} ms base backoff",
            self.storage_max_attempts, self.storage_backoff_ms
        );
        if self.force {
            warn!("   FORCE is on: clusters below threshold will be merged");
        }
        if self.dry_run {
            info!("   DRY RUN: no changes will be written to the catalog");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 6] = [
        "DEDUPE_THRESHOLD",
        "DEDUPE_DRY_RUN",
        "DEDUPE_LIMIT",
        "DEDUPE_FORCE",
        "DEDUPE_REJECTED_POLICY",
        "DEDUPE_MAX_CONCURRENT_MERGES",
    ];

    // Single test so parallel tests never race on the same variables
    #[test]
    fn test_config_from_env() {
        for var in VARS {
            env::remove_var(var);
        }
        let config = EngineConfig::from_env();
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
        assert!(config.dry_run);
        assert_eq!(config.limit, None);
        assert_eq!(config.rejected_policy, RejectedClusterPolicy::Reevaluate);
        assert_eq!(config.max_concurrent_merges, 4);

        env::set_var("DEDUPE_THRESHOLD", "0.9");
        env::set_var("DEDUPE_DRY_RUN", "false");
        env::set_var("DEDUPE_LIMIT", "25");
        env::set_var("DEDUPE_FORCE", "true");
        env::set_var("DEDUPE_REJECTED_POLICY", "Exclude");
        env::set_var("DEDUPE_MAX_CONCURRENT_MERGES", "many");
        let config = EngineConfig::from_env();
        assert_eq!(config.threshold, 0.9);
        assert!(!config.dry_run);
        assert_eq!(config.limit, Some(25));
        assert!(config.force);
        assert_eq!(config.rejected_policy, RejectedClusterPolicy::Exclude);
        // Malformed value falls back to the default
        assert_eq!(config.max_concurrent_merges, 4);

        // Cleanup
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let bad_threshold = EngineConfig {
            threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(matches!(bad_threshold.validate(), Err(DedupeError::Configuration(_))));

        let nan = RunOptions {
            threshold: f64::NAN,
            ..RunOptions::default()
        };
        assert!(nan.validate().is_err());

        let zero_limit = RunOptions {
            limit: Some(0),
            ..RunOptions::default()
        };
        assert!(zero_limit.validate().is_err());

        let no_workers = EngineConfig {
            max_workers: 0,
            ..EngineConfig::default()
        };
        assert!(no_workers.validate().is_err());
    }

    #[test]
    fn test_run_options_override_config() {
        let options = RunOptions {
            dry_run: false,
            limit: Some(3),
            threshold: 0.7,
            force: true,
        };
        let config = EngineConfig::default().with_run_options(&options);
        assert_eq!(config.run_options(), options);
        assert_eq!(config.retry_policy().base_backoff, Duration::from_millis(50));
    }
}
