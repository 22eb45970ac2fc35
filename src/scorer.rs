//! Pressure-based node scoring.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::bandwidth::Bandwidth;
use crate::cache::handle::{BandwidthError, CacheHandle};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScoreError {
    #[error("unsupported scoring strategy {strategy:?}")]
    Unsupported { strategy: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreStrategy {
    /// Favor less-pressured nodes.
    LeastAllocated,
    /// Favor more-pressured nodes (bin-packing).
    MostAllocated,
}

impl FromStr for ScoreStrategy {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LeastAllocated" => Ok(ScoreStrategy::LeastAllocated),
            "MostAllocated" => Ok(ScoreStrategy::MostAllocated),
            other => Err(ScoreError::Unsupported {
                strategy: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ScoreStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreStrategy::LeastAllocated => write!(f, "LeastAllocated"),
            ScoreStrategy::MostAllocated => write!(f, "MostAllocated"),
        }
    }
}

impl ScoreStrategy {
    /// Score `node` for `request` in `[0, max_score]`.
    ///
    /// Nodes without bandwidth accounting get `max_score`.
    pub fn score(
        &self,
        handle: &CacheHandle,
        node: &str,
        request: &Bandwidth,
        max_score: i64,
    ) -> Result<i64, BandwidthError> {
        if !handle.is_registered(node) {
            return Ok(max_score);
        }
        let ratio = handle.pressure_ratio(node, request)?;
        let fraction = match self {
            ScoreStrategy::LeastAllocated => 1.0 - ratio,
            ScoreStrategy::MostAllocated => ratio,
        };
        let score = (fraction * max_score as f64) as i64;
        Ok(score.clamp(0, max_score.max(0)))
    }
}
