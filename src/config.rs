//! Runtime configuration for diskio-aware.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Missing sections and fields fall back to their defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::normalizer::DiskProfile;
use crate::reservation::queue::RateLimit;
use crate::reservation::reconciler::RetryPolicy;
use crate::scorer::{ScoreError, ScoreStrategy};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "diskio-aware", about = "Disk I/O bandwidth admission service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address. Overrides `server.listen`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Node scoring.
    pub scoring: ScoringConfig,

    /// Reservation accounting.
    pub reservation: ReservationConfig,

    /// Reconciliation with the external node records.
    pub reconcile: ReconcileConfig,

    /// Disk profiles installed as statically linked normalizers.
    pub normalizers: Vec<DiskProfile>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// "LeastAllocated" or "MostAllocated".
    pub strategy: String,

    /// Upper bound of node scores.
    pub max_score: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            strategy: "LeastAllocated".to_string(),
            max_score: 100,
        }
    }
}

impl ScoringConfig {
    pub fn strategy(&self) -> Result<ScoreStrategy, ScoreError> {
        self.strategy.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Workloads in these namespaces bypass bandwidth accounting entirely.
    pub namespace_allowlist: Vec<String>,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            namespace_allowlist: vec!["kube-system".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Number of reconcile workers.
    pub workers: usize,

    /// Attempts per task, including the first.
    pub max_attempts: u32,

    /// Back-off before the first retry.
    pub base_backoff_ms: u64,

    /// Back-off ceiling.
    pub max_backoff_ms: u64,

    /// Random extra delay as a fraction of the back-off.
    pub jitter: f64,

    /// Sustained reconciles per second.
    pub qps: f64,

    /// Reconciles allowed back-to-back.
    pub burst: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter: 1.0,
            qps: 10.0,
            burst: 100,
        }
    }
}

impl ReconcileConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.base_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            jitter: self.jitter,
        }
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit::new(self.qps, self.burst)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scoring.strategy()?;
        ensure!(self.scoring.max_score > 0, "scoring.max_score must be positive");

        let r = &self.reconcile;
        ensure!(r.workers > 0, "reconcile.workers must be at least 1");
        ensure!(r.max_attempts > 0, "reconcile.max_attempts must be at least 1");
        ensure!(
            r.base_backoff_ms <= r.max_backoff_ms,
            "reconcile.base_backoff_ms exceeds reconcile.max_backoff_ms"
        );
        ensure!(
            r.jitter.is_finite() && r.jitter >= 0.0,
            "reconcile.jitter must be a non-negative number"
        );
        ensure!(r.qps > 0.0, "reconcile.qps must be positive");
        ensure!(r.burst > 0, "reconcile.burst must be at least 1");

        for profile in &self.normalizers {
            for (block_size, ratio) in profile.read_ratio.iter().chain(&profile.write_ratio) {
                if !ratio.is_finite() || *ratio < 0.0 {
                    bail!(
                        "normalizer {}: invalid ratio {} for block size {}",
                        profile.key(),
                        ratio,
                        block_size
                    );
                }
            }
        }
        Ok(())
    }
}
