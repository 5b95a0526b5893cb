//! Token bucket state and refill arithmetic.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Time granularity over which a rule's rate is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl Unit {
    /// Get the duration of this unit.
    pub fn duration(&self) -> Duration {
        match self {
            Unit::Second => Duration::from_secs(1),
            Unit::Minute => Duration::from_secs(60),
            Unit::Hour => Duration::from_secs(3600),
            Unit::Day => Duration::from_secs(86400),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Second => "second",
            Unit::Minute => "minute",
            Unit::Hour => "hour",
            Unit::Day => "day",
        }
    }
}

impl FromStr for Unit {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "second" => Ok(Unit::Second),
            "minute" => Ok(Unit::Minute),
            "hour" => Ok(Unit::Hour),
            "day" => Ok(Unit::Day),
            other => Err(TollgateError::Config(format!(
                "unknown unit '{}', expected second, minute, hour or day",
                other
            ))),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refill rate and capacity of a bucket.
///
/// `rate` tokens are granted per `unit`, and a bucket never holds more
/// than `burst` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    rate: u64,
    burst: u64,
    unit: Unit,
}

impl Limit {
    /// Create a limit, rejecting a zero rate or burst.
    pub fn new(rate: u64, burst: u64, unit: Unit) -> Result<Self> {
        if rate == 0 {
            return Err(TollgateError::Config("rate must be greater than zero".into()));
        }
        if burst == 0 {
            return Err(TollgateError::Config("burst must be greater than zero".into()));
        }
        Ok(Self { rate, burst, unit })
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Time for one token to accrue.
    pub fn token_interval(&self) -> Duration {
        Duration::from_secs_f64(self.seconds_per_token())
    }

    /// Time for an empty bucket to refill to `burst`.
    ///
    /// Saturates at `Duration::MAX` for bursts too large to represent.
    pub fn time_to_full(&self) -> Duration {
        Duration::try_from_secs_f64(self.burst as f64 * self.seconds_per_token())
            .unwrap_or(Duration::MAX)
    }

    fn seconds_per_token(&self) -> f64 {
        self.unit.duration().as_secs_f64() / self.rate as f64
    }
}

/// Token bucket for a single key.
///
/// Tokens accrue continuously, so a fraction of a token is kept between
/// checks instead of resetting at unit boundaries.
#[derive(Debug, Clone)]
pub struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Create a bucket holding `burst` tokens.
    pub fn full(limit: &Limit, now: Instant) -> Self {
        Self {
            tokens: limit.burst as f64,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last update, then take one
    /// token if available.
    ///
    /// Returns `true` if the request is allowed. A rejected request leaves
    /// the balance untouched.
    pub fn consume(&mut self, limit: &Limit, now: Instant) -> bool {
        self.refill(limit, now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available.
    ///
    /// Called right after [`Bucket::consume`] with the same `now`, the
    /// refill is a no-op and the wait reflects the post-consume state.
    pub fn retry_after(&mut self, limit: &Limit, now: Instant) -> Duration {
        self.refill(limit, now);

        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) * limit.seconds_per_token())
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    fn refill(&mut self, limit: &Limit, now: Instant) {
        // An out-of-order `now` refills nothing and keeps the newer stamp.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let accrued = elapsed.as_secs_f64() / limit.seconds_per_token();
        self.tokens = (self.tokens + accrued).min(limit.burst as f64);
        self.last_refill = now;
    }
}
