use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::NormalizeError;
use crate::cache::bandwidth::Bandwidth;
use crate::reservation::context::Workload;

/// A normalizer: raw I/O intent in, JSON bandwidth request out.
pub type NormalizeFn = Arc<dyn Fn(&str) -> Result<String, NormalizeError> + Send + Sync>;

/// Name-keyed table of normalizers.
#[derive(Default)]
pub struct NormalizerRegistry {
    entries: RwLock<HashMap<String, NormalizeFn>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the normalizer under `key`.
    pub fn set(&self, key: &str, normalize: NormalizeFn) -> Result<(), NormalizeError> {
        if key.is_empty() {
            return Err(NormalizeError::EmptyKey);
        }
        let replaced = self
            .entries
            .write()
            .insert(key.to_string(), normalize)
            .is_some();
        info!(key, replaced, "Registered normalizer");
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<NormalizeFn, NormalizeError> {
        if key.is_empty() {
            return Err(NormalizeError::EmptyKey);
        }
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| NormalizeError::NotFound {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        debug!(key, removed, "Removed normalizer");
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Look up the normalizer for `key` and run it over `raw`.
    pub fn normalize(&self, key: &str, raw: &str) -> Result<Bandwidth, NormalizeError> {
        let normalize = self.get(key)?;
        parse_request(&normalize(raw)?)
    }

    /// Bandwidth need of `workload` under the normalizer for `key`.
    ///
    /// `None` when the workload carries no I/O intent annotation.
    pub fn request_for(
        &self,
        key: &str,
        workload: &Workload,
    ) -> Result<Option<Bandwidth>, NormalizeError> {
        match workload.io_intent() {
            Some(raw) => self.normalize(key, raw).map(Some),
            None => Ok(None),
        }
    }
}

/// Parse normalizer output into a request.
///
/// `total` is always recomputed as `read + write`, whatever the normalizer said.
pub fn parse_request(output: &str) -> Result<Bandwidth, NormalizeError> {
    let parsed: Bandwidth = serde_json::from_str(output)
        .map_err(|e| NormalizeError::InvalidRequest(e.to_string()))?;
    Ok(Bandwidth::new(
        parsed.read,
        parsed.write,
        parsed.read.saturating_add(parsed.write),
    ))
}
