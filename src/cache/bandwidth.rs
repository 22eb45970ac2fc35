//! Bandwidth values and quantity parsing.
//!
//! Every device and every workload request is tracked along three independent
//! dimensions: read, write and total bytes per second. No dimension may stand
//! in for another during admission.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// One of the three independently tracked bandwidth dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Read,
    Write,
    Total,
}

impl Dimension {
    /// All dimensions, in the order admission checks them.
    pub const ALL: [Dimension; 3] = [Dimension::Read, Dimension::Write, Dimension::Total];
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::Read => write!(f, "read"),
            Dimension::Write => write!(f, "write"),
            Dimension::Total => write!(f, "total"),
        }
    }
}

/// Read/write/total bandwidth in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bandwidth {
    #[serde(default, deserialize_with = "deserialize_quantity")]
    pub read: u64,
    #[serde(default, deserialize_with = "deserialize_quantity")]
    pub write: u64,
    #[serde(default, deserialize_with = "deserialize_quantity")]
    pub total: u64,
}

impl Bandwidth {
    pub const ZERO: Bandwidth = Bandwidth {
        read: 0,
        write: 0,
        total: 0,
    };

    pub fn new(read: u64, write: u64, total: u64) -> Self {
        Self { read, write, total }
    }

    /// Value along a single dimension.
    pub fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Read => self.read,
            Dimension::Write => self.write,
            Dimension::Total => self.total,
        }
    }

    /// First dimension (read, write, total) on which `self` exceeds `available`.
    pub fn first_exceeding(&self, available: &Bandwidth) -> Option<Dimension> {
        Dimension::ALL
            .into_iter()
            .find(|&d| self.get(d) > available.get(d))
    }

    /// Componentwise subtraction; `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &Bandwidth) -> Option<Bandwidth> {
        Some(Bandwidth {
            read: self.read.checked_sub(other.read)?,
            write: self.write.checked_sub(other.write)?,
            total: self.total.checked_sub(other.total)?,
        })
    }

    /// Componentwise addition, each dimension capped at `cap`.
    pub fn add_capped(&self, other: &Bandwidth, cap: &Bandwidth) -> Bandwidth {
        Bandwidth {
            read: self.read.saturating_add(other.read).min(cap.read),
            write: self.write.saturating_add(other.write).min(cap.write),
            total: self.total.saturating_add(other.total).min(cap.total),
        }
    }

    /// Componentwise minimum.
    pub fn min(&self, other: &Bandwidth) -> Bandwidth {
        Bandwidth {
            read: self.read.min(other.read),
            write: self.write.min(other.write),
            total: self.total.min(other.total),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Bandwidth::ZERO
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{read: {}, write: {}, total: {}}}",
            self.read, self.write, self.total
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("unknown quantity suffix {0:?}")]
    UnknownSuffix(String),

    #[error("quantity {0:?} overflows")]
    Overflow(String),
}

fn suffix_multiplier(suffix: &str) -> Option<u64> {
    let m = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    Some(m)
}

/// Parse a quantity such as `"1000"`, `"100Mi"`, `"1.5G"` or `"12.34Mi"` into bytes.
///
/// Fractional bytes round up, so a parsed request is never smaller than asked.
pub fn parse_quantity(input: &str) -> Result<u64, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() || number == "." {
        return Err(QuantityError::Invalid(input.to_string()));
    }

    let multiplier =
        suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix(suffix.to_string()))?;

    if !number.contains('.') {
        let base: u64 = number
            .parse()
            .map_err(|_| QuantityError::Overflow(input.to_string()))?;
        return base
            .checked_mul(multiplier)
            .ok_or_else(|| QuantityError::Overflow(input.to_string()));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(input.to_string()))?;
    let bytes = (value * multiplier as f64).ceil();
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(QuantityError::Overflow(input.to_string()));
    }
    Ok(bytes as u64)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Int(u64),
    Float(f64),
    Text(String),
}

/// Serde helper accepting either a number of bytes or a quantity string.
pub fn deserialize_quantity<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawQuantity::deserialize(deserializer)? {
        RawQuantity::Int(v) => Ok(v),
        RawQuantity::Float(v) if v >= 0.0 && v.is_finite() => Ok(v.ceil() as u64),
        RawQuantity::Float(v) => Err(serde::de::Error::custom(format!(
            "invalid bandwidth value {v}"
        ))),
        RawQuantity::Text(s) => parse_quantity(&s).map_err(serde::de::Error::custom),
    }
}
