//! Inter-record delay range.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::error::GapRangeError;

/// Inclusive millisecond range the delay between split records is drawn from.
///
/// Always satisfies `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GapRange {
    min_ms: u64,
    max_ms: u64,
}

impl GapRange {
    /// No delay.
    pub const NONE: GapRange = GapRange {
        min_ms: 0,
        max_ms: 0,
    };

    /// Create a range, rejecting `min > max`.
    pub fn new(min_ms: u64, max_ms: u64) -> Result<Self, GapRangeError> {
        if min_ms > max_ms {
            return Err(GapRangeError::Inverted {
                min: min_ms,
                max: max_ms,
            });
        }
        Ok(Self { min_ms, max_ms })
    }

    /// Lower bound.
    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    /// Upper bound.
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Draw a delay uniformly from the range. Zero when the upper bound is zero.
    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rand::rng())
    }

    /// Draw a delay using the provided generator.
    pub fn sample_with<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.random_range(self.min_ms..=self.max_ms))
    }
}

impl fmt::Display for GapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.min_ms, self.max_ms)
    }
}

/// Parses `min,max` in milliseconds. An empty string means no delay and an
/// empty side counts as zero.
impl FromStr for GapRange {
    type Err = GapRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(GapRange::NONE);
        }
        let (min, max) = s.split_once(',').ok_or(GapRangeError::Format)?;
        if max.contains(',') {
            return Err(GapRangeError::Format);
        }
        GapRange::new(parse_bound("min", min)?, parse_bound("max", max)?)
    }
}

fn parse_bound(bound: &'static str, value: &str) -> Result<u64, GapRangeError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|_| GapRangeError::NotInteger {
        bound,
        value: value.to_string(),
    })
}
