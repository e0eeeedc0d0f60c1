use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

/// Amount of memory in bytes.
///
/// Parses human readable sizes with binary multiples (`"512k"`, `"128 mb"`, `"1g"`);
/// a bare number is a byte count. Serialized as a plain byte count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MemorySize(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemorySizeParseError {
    #[error("empty memory size")]
    Empty,
    #[error("invalid number in memory size: {0}")]
    InvalidNumber(String),
    #[error("unknown memory unit: {0} (expected: b|k|m|g|t)")]
    UnknownUnit(String),
    #[error("memory size overflows 64 bits: {0}")]
    Overflow(String),
}

impl MemorySize {
    pub const ZERO: MemorySize = MemorySize(0);

    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn from_kibibytes(kib: u64) -> Self {
        Self(kib * KIB)
    }

    #[inline]
    pub const fn from_mebibytes(mib: u64) -> Self {
        Self(mib * MIB)
    }

    #[inline]
    pub const fn from_gibibytes(gib: u64) -> Self {
        Self(gib * GIB)
    }

    #[inline]
    pub const fn bytes(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn checked_add(self, other: MemorySize) -> Option<MemorySize> {
        self.0.checked_add(other.0).map(MemorySize)
    }

    #[inline]
    pub fn checked_sub(self, other: MemorySize) -> Option<MemorySize> {
        self.0.checked_sub(other.0).map(MemorySize)
    }

    #[inline]
    pub fn saturating_add(self, other: MemorySize) -> MemorySize {
        MemorySize(self.0.saturating_add(other.0))
    }

    #[inline]
    pub fn saturating_sub(self, other: MemorySize) -> MemorySize {
        MemorySize(self.0.saturating_sub(other.0))
    }
}

impl FromStr for MemorySize {
    type Err = MemorySizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        if norm.is_empty() {
            return Err(MemorySizeParseError::Empty);
        }

        let split = norm
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(norm.len());
        let (number, unit) = norm.split_at(split);
        let number: u64 = number
            .parse()
            .map_err(|_| MemorySizeParseError::InvalidNumber(s.to_string()))?;

        let multiplier = match unit.trim() {
            "" | "b" | "bytes" => 1,
            "k" | "kb" | "kib" | "kibibytes" => KIB,
            "m" | "mb" | "mib" | "mebibytes" => MIB,
            "g" | "gb" | "gib" | "gibibytes" => GIB,
            "t" | "tb" | "tib" | "tebibytes" => TIB,
            other => return Err(MemorySizeParseError::UnknownUnit(other.to_string())),
        };

        number
            .checked_mul(multiplier)
            .map(MemorySize)
            .ok_or_else(|| MemorySizeParseError::Overflow(s.to_string()))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes == 0 {
            return f.write_str("0 bytes");
        }
        for (unit, name) in [(TIB, "tb"), (GIB, "gb"), (MIB, "mb"), (KIB, "kb")] {
            if bytes % unit == 0 {
                return write!(f, "{} {name}", bytes / unit);
            }
        }
        write!(f, "{bytes} bytes")
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(bytes) => Ok(MemorySize(bytes)),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
