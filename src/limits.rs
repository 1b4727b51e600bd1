//! CPU and memory caps applied by the container backend.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;
const PIB: u64 = 1024 * TIB;

/// Invalid limit value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("invalid memory limit '{0}': expected a size like 512m, 1.5g or 1t")]
    Memory(String),

    #[error("memory limit must be greater than zero")]
    ZeroMemory,

    #[error("invalid cpu limit '{0}': expected a positive number of CPUs")]
    Cpus(String),
}

/// Memory cap in bytes, written the way Docker accepts it (`256m`, `1g`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryLimit(u64);

impl MemoryLimit {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::from_mib(256)
    }
}

impl FromStr for MemoryLimit {
    type Err = LimitError;

    /// Accepts what `docker run --memory` accepts: a decimal number, an
    /// optional space, then an optional `k`/`m`/`g`/`t`/`p` unit with an
    /// optional `i` and `b` (`512m`, `1.5g`, `512MiB`, `1t`, `1048576`).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LimitError::Memory(s.to_string());

        let raw = s.trim().to_ascii_lowercase();
        let number_end = raw
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(raw.len());
        let (number, suffix) = raw.split_at(number_end);

        let unit = suffix.trim_start();
        let unit = unit.strip_suffix('b').unwrap_or(unit);
        let unit = unit.strip_suffix('i').unwrap_or(unit);
        let multiplier = match unit {
            "" => 1,
            "k" => KIB,
            "m" => MIB,
            "g" => GIB,
            "t" => TIB,
            "p" => PIB,
            _ => return Err(invalid()),
        };

        let bytes = if number.contains('.') {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            let bytes = value * multiplier as f64;
            if !bytes.is_finite() || bytes >= u64::MAX as f64 {
                return Err(invalid());
            }
            // Docker truncates fractional byte counts.
            bytes as u64
        } else {
            let value: u64 = number.parse().map_err(|_| invalid())?;
            value.checked_mul(multiplier).ok_or_else(invalid)?
        };

        if bytes == 0 {
            return Err(LimitError::ZeroMemory);
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MemoryLimit {
    type Error = LimitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemoryLimit> for String {
    fn from(value: MemoryLimit) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        if b != 0 && b % TIB == 0 {
            write!(f, "{}t", b / TIB)
        } else if b != 0 && b % GIB == 0 {
            write!(f, "{}g", b / GIB)
        } else if b != 0 && b % MIB == 0 {
            write!(f, "{}m", b / MIB)
        } else if b != 0 && b % KIB == 0 {
            write!(f, "{}k", b / KIB)
        } else {
            write!(f, "{b}")
        }
    }
}

/// Per-container resource caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Number of CPUs (Docker `--cpus`).
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Memory cap (Docker `--memory`).
    #[serde(default)]
    pub memory: MemoryLimit,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory: MemoryLimit::default(),
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), LimitError> {
        if !self.cpus.is_finite() || self.cpus <= 0.0 {
            return Err(LimitError::Cpus(self.cpus.to_string()));
        }
        if self.memory.bytes() == 0 {
            return Err(LimitError::ZeroMemory);
        }
        Ok(())
    }

    /// `--cpus` and `--memory` flags for `docker run`.
    pub fn docker_flags(&self) -> [String; 2] {
        [
            format!("--cpus={}", self.cpus),
            format!("--memory={}", self.memory),
        ]
    }
}

const fn default_cpus() -> f64 {
    1.0
}
