use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{NormalizeError, NormalizeFn};
use crate::cache::bandwidth::{deserialize_quantity, Bandwidth};

/// Block sizes a profile may carry ratios for.
pub const BLOCK_SIZES: [&str; 6] = ["512", "1k", "4k", "8k", "16k", "32k"];

/// Measured throughput ratios of one disk model, per block size.
///
/// A ratio scales the requested bytes/sec at that block size into the
/// equivalent load on the reference scale the node agent reports in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskProfile {
    pub vendor: String,
    pub model: String,
    #[serde(default)]
    pub read_ratio: BTreeMap<String, f64>,
    #[serde(default)]
    pub write_ratio: BTreeMap<String, f64>,
}

impl DiskProfile {
    pub fn key(&self) -> String {
        format!("{}-{}", self.vendor, self.model)
    }
}

/// Raw I/O intent, e.g. `{"rbps": "30Mi", "wbps": "20Mi", "blockSize": "4k"}`.
#[derive(Debug, Deserialize)]
struct IoIntent {
    #[serde(default, deserialize_with = "deserialize_quantity")]
    rbps: u64,
    #[serde(default, deserialize_with = "deserialize_quantity")]
    wbps: u64,
    #[serde(rename = "blockSize", alias = "blocksize")]
    block_size: String,
}

/// Statically linked normalizer driven by a [`DiskProfile`].
#[derive(Debug, Clone)]
pub struct ProfileNormalizer {
    profile: DiskProfile,
}

impl ProfileNormalizer {
    pub fn new(profile: DiskProfile) -> Self {
        Self { profile }
    }

    pub fn key(&self) -> String {
        self.profile.key()
    }

    /// Scale the raw intent by the profile's ratios for its block size.
    ///
    /// Block sizes without a recorded ratio scale by 1.0.
    pub fn normalize(&self, raw: &str) -> Result<String, NormalizeError> {
        let intent: IoIntent =
            serde_json::from_str(raw).map_err(|e| NormalizeError::InvalidRequest(e.to_string()))?;

        let block_size = intent.block_size.as_str();
        if !BLOCK_SIZES.contains(&block_size) {
            return Err(NormalizeError::UnsupportedBlockSize(intent.block_size));
        }

        let read = scale(intent.rbps, ratio(&self.profile.read_ratio, block_size));
        let write = scale(intent.wbps, ratio(&self.profile.write_ratio, block_size));
        let request = Bandwidth::new(read, write, read.saturating_add(write));

        serde_json::to_string(&request).map_err(|e| NormalizeError::InvalidRequest(e.to_string()))
    }

    pub fn into_fn(self) -> NormalizeFn {
        Arc::new(move |raw: &str| self.normalize(raw))
    }
}

fn ratio(table: &BTreeMap<String, f64>, block_size: &str) -> f64 {
    table.get(block_size).copied().unwrap_or(1.0)
}

fn scale(bytes: u64, ratio: f64) -> u64 {
    (bytes as f64 * ratio).ceil() as u64
}
