//! Vendor/model-keyed bandwidth normalizers.
//!
//! A normalizer turns a workload's raw I/O intent annotation into a JSON
//! bandwidth request for one particular disk model. Normalizers are plain
//! functions looked up by `"{vendor}-{model}"`.
//!
//! - [`registry`]: NormalizerRegistry and request parsing
//! - [`profile`]: ProfileNormalizer, built from a disk's block-size profile

pub mod profile;
pub mod registry;

use thiserror::Error;

use crate::cache::bandwidth::QuantityError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("normalizer name cannot be empty")]
    EmptyKey,

    #[error("normalizer {key} not found")]
    NotFound { key: String },

    #[error("invalid I/O request: {0}")]
    InvalidRequest(String),

    #[error("unsupported block size {0:?}")]
    UnsupportedBlockSize(String),

    #[error(transparent)]
    InvalidQuantity(#[from] QuantityError),
}

pub use profile::{DiskProfile, ProfileNormalizer};
pub use registry::{parse_request, NormalizeFn, NormalizerRegistry};
