//! Human-readable tensor sizes ("2K", "1M", "8G").
//!
//! Units are binary (powers of 1024). Sizes are always compared as raw byte
//! counts; the formatted form is for display and for the command line handed to
//! the external benchmark.

use crate::error::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// A byte count parsed from a `<number>[K|M|G]` token. Always at least one byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SizeSpec(u64);

impl SizeSpec {
    /// Parse a size token.
    ///
    /// The unit is case-insensitive and may carry a trailing `B` (`2KB` is the
    /// same as `2K`). A bare number is a byte count.
    ///
    /// ```rust
    /// # use collective_bench::size::SizeSpec;
    /// assert_eq!(SizeSpec::parse("2K").unwrap().bytes(), 2048);
    /// assert_eq!(SizeSpec::parse("1m").unwrap().bytes(), 1048576);
    /// assert!(SizeSpec::parse("-5K").is_err());
    /// ```
    pub fn parse(token: &str) -> Result<Self> {
        let invalid = || BenchError::InvalidSizeFormat {
            token: token.to_string(),
        };

        let upper = token.trim().to_ascii_uppercase();
        let body = match upper.strip_suffix('B') {
            Some(stripped) if stripped.ends_with(['K', 'M', 'G']) => stripped,
            _ => upper.as_str(),
        };

        let (digits, multiplier) = match body.chars().last() {
            Some('K') => (&body[..body.len() - 1], KIB),
            Some('M') => (&body[..body.len() - 1], MIB),
            Some('G') => (&body[..body.len() - 1], GIB),
            _ => (body, 1),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;
        if bytes == 0 {
            return Err(invalid());
        }
        Ok(SizeSpec(bytes))
    }

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        (bytes > 0).then_some(SizeSpec(bytes))
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Render a byte count with the largest unit that divides it exactly.
    ///
    /// ```rust
    /// # use collective_bench::size::SizeSpec;
    /// assert_eq!(SizeSpec::format(8 * 1024 * 1024 * 1024), "8G");
    /// assert_eq!(SizeSpec::format(1536), "1536");
    /// ```
    pub fn format(bytes: u64) -> String {
        if bytes == 0 {
            return "0".to_string();
        }
        for (unit, suffix) in [(GIB, "G"), (MIB, "M"), (KIB, "K")] {
            if bytes % unit == 0 {
                return format!("{}{}", bytes / unit, suffix);
            }
        }
        bytes.to_string()
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&SizeSpec::format(self.0))
    }
}

impl std::str::FromStr for SizeSpec {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        SizeSpec::parse(s)
    }
}

/// Sweep of message sizes handed to the external benchmark.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: SizeSpec,
    pub max: SizeSpec,
    pub step_factor: u32,
}

impl SizeRange {
    /// Geometric progression `min, min*step, ...` up to and including `max`.
    pub fn sizes(&self) -> Vec<u64> {
        let mut sizes = Vec::new();
        if self.step_factor < 2 {
            return sizes;
        }
        let mut current = self.min.bytes();
        while current <= self.max.bytes() {
            sizes.push(current);
            match current.checked_mul(u64::from(self.step_factor)) {
                Some(next) => current = next,
                None => break,
            }
        }
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_values() {
        assert_eq!(SizeSpec::parse("2K").unwrap().bytes(), 2048);
        assert_eq!(SizeSpec::parse("1M").unwrap().bytes(), 1_048_576);
        assert_eq!(SizeSpec::parse("8G").unwrap().bytes(), 8_589_934_592);
        assert_eq!(SizeSpec::parse("512").unwrap().bytes(), 512);
        assert_eq!(SizeSpec::parse("4kb").unwrap().bytes(), 4096);
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        for token in ["abc", "-5K", "", "K", "0", "0K", "1.5M", "2T", "+4K", "99999999999999G"] {
            match SizeSpec::parse(token) {
                Err(BenchError::InvalidSizeFormat { token: t }) => assert_eq!(t, token),
                other => panic!("expected InvalidSizeFormat for {:?}, got {:?}", token, other),
            }
        }
    }

    #[test]
    fn test_format_round_trip() {
        for token in ["1", "1000", "2K", "1536K", "1M", "3M", "1G", "8G"] {
            let parsed = SizeSpec::parse(token).unwrap();
            let reparsed = SizeSpec::parse(&SizeSpec::format(parsed.bytes())).unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {}", token);
        }
        assert_eq!(SizeSpec::format(1024 * 1024), "1M");
        assert_eq!(SizeSpec::format(1536 * 1024), "1536K");
    }

    #[test]
    fn test_size_range_progression() {
        let range = SizeRange {
            min: SizeSpec::parse("2K").unwrap(),
            max: SizeSpec::parse("16K").unwrap(),
            step_factor: 2,
        };
        assert_eq!(range.sizes(), vec![2048, 4096, 8192, 16384]);

        let range = SizeRange {
            min: SizeSpec::parse("1K").unwrap(),
            max: SizeSpec::parse("10K").unwrap(),
            step_factor: 4,
        };
        assert_eq!(range.sizes(), vec![1024, 4096]);
    }
}
