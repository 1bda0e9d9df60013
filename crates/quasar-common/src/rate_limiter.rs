use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QuasarError;

/// Refill unit of a token bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(self) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(1),
            TimeUnit::Microseconds => Duration::from_micros(1),
            TimeUnit::Milliseconds => Duration::from_millis(1),
            TimeUnit::Seconds => Duration::from_secs(1),
            TimeUnit::Minutes => Duration::from_secs(60),
            TimeUnit::Hours => Duration::from_secs(3_600),
            TimeUnit::Days => Duration::from_secs(86_400),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeUnit::Nanoseconds => "NANOSECONDS",
            TimeUnit::Microseconds => "MICROSECONDS",
            TimeUnit::Milliseconds => "MILLISECONDS",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Hours => "HOURS",
            TimeUnit::Days => "DAYS",
        };
        f.write_str(s)
    }
}

/// Token-bucket limit: `limit` requests per one `unit`.
///
/// Either field may be absent. A config is *valid* when both are present and
/// `limit` is a positive integer, *empty* when both are absent, and *partial*
/// otherwise. Partial configs are accepted from input because they are merged
/// field by field into an existing limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimiter")]
pub struct RateLimiterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<TimeUnit>,
}

/// Capacity and refill rate derived from a valid [`RateLimiterConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketSpec {
    pub capacity: f64,
    pub refill_per_second: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Text(String),
    Integer(i64),
    Float(f64),
}

#[derive(Deserialize)]
struct RawRateLimiter {
    #[serde(default)]
    limit: Option<RawLimit>,
    #[serde(default)]
    unit: Option<TimeUnit>,
}

impl TryFrom<RawRateLimiter> for RateLimiterConfig {
    type Error = QuasarError;

    fn try_from(raw: RawRateLimiter) -> Result<Self, Self::Error> {
        let limit = match raw.limit {
            None => None,
            Some(RawLimit::Text(s)) => Some(validate_limit(&s)?),
            Some(RawLimit::Integer(n)) => Some(validate_limit(&n.to_string())?),
            Some(RawLimit::Float(f)) => {
                return Err(QuasarError::Validation(format!(
                    "rate limiter limit must be a positive integer, got {f}"
                )))
            }
        };
        Ok(Self {
            limit,
            unit: raw.unit,
        })
    }
}

fn validate_limit(raw: &str) -> Result<String, QuasarError> {
    let trimmed = raw.trim();
    match trimmed.parse::<i64>() {
        Ok(n) if n > 0 => Ok(n.to_string()),
        Ok(n) => Err(QuasarError::Validation(format!(
            "rate limiter limit must be a positive integer, got {n}"
        ))),
        Err(_) => Err(QuasarError::Validation(format!(
            "rate limiter limit must be a positive integer, got \"{trimmed}\""
        ))),
    }
}

impl RateLimiterConfig {
    pub fn new(limit: impl Into<String>, unit: TimeUnit) -> Self {
        Self {
            limit: Some(limit.into()),
            unit: Some(unit),
        }
    }

    /// Parse a limiter from JSON. Unknown fields are ignored and `null`
    /// fields stay absent; a non-positive or non-numeric limit is rejected.
    pub fn parse(input: &str) -> Result<Self, QuasarError> {
        serde_json::from_str(input).map_err(|e| QuasarError::Validation(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, QuasarError> {
        serde_json::from_value(value).map_err(|e| QuasarError::Validation(e.to_string()))
    }

    fn limit_value(&self) -> Option<u64> {
        self.limit
            .as_deref()
            .and_then(|l| l.trim().parse::<u64>().ok())
            .filter(|n| *n > 0)
    }

    pub fn is_valid(&self) -> bool {
        self.unit.is_some() && self.limit_value().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.unit.is_none()
    }

    /// Field-level merge: each field of `update` wins only when present.
    pub fn merge(&self, update: &RateLimiterConfig) -> RateLimiterConfig {
        RateLimiterConfig {
            limit: update.limit.clone().or_else(|| self.limit.clone()),
            unit: update.unit.or(self.unit),
        }
    }

    /// [`merge`](Self::merge) over optional operands.
    pub fn merged(
        base: Option<&RateLimiterConfig>,
        update: Option<&RateLimiterConfig>,
    ) -> Option<RateLimiterConfig> {
        match (base, update) {
            (Some(base), Some(update)) => Some(base.merge(update)),
            (None, Some(update)) => Some(update.clone()),
            (Some(base), None) => Some(base.clone()),
            (None, None) => None,
        }
    }

    /// Whether applying `candidate` on top of `current` would change anything.
    pub fn update_validity_pre_check(
        current: Option<&RateLimiterConfig>,
        candidate: Option<&RateLimiterConfig>,
    ) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        if candidate.is_empty() {
            return false;
        }
        match current {
            None => true,
            Some(current) if current.is_empty() => true,
            Some(current) => current.limit != candidate.limit || current.unit != candidate.unit,
        }
    }

    /// Whether a serving model must be redeployed after `update` is merged
    /// into `before`.
    ///
    /// Workers rebuild a limiter only when its unit changes (including the
    /// transition between having a unit and having none) and the limiter is
    /// enforceable on at least one side of the change. A pure limit change
    /// resizes the live bucket in place.
    pub fn is_deploy_required_after_update(
        before: Option<&RateLimiterConfig>,
        update: Option<&RateLimiterConfig>,
    ) -> bool {
        if !Self::update_validity_pre_check(before, update) {
            return false;
        }
        let Some(merged) = Self::merged(before, update) else {
            return false;
        };
        let before_unit = before.and_then(|b| b.unit);
        if before_unit == merged.unit {
            return false;
        }
        merged.is_valid() || before.is_some_and(RateLimiterConfig::is_valid)
    }

    /// Bucket parameters: capacity of `limit` tokens refilled at `limit` per unit.
    pub fn token_bucket_spec(&self) -> Option<TokenBucketSpec> {
        let limit = self.limit_value()? as f64;
        let unit = self.unit?.duration().as_secs_f64();
        if unit <= 0.0 {
            return None;
        }
        Some(TokenBucketSpec {
            capacity: limit,
            refill_per_second: limit / unit,
        })
    }

    /// Reject partial limiters where a standalone limiter is required.
    pub fn require_valid_or_empty(&self, what: &str) -> Result<(), QuasarError> {
        if self.is_empty() || self.is_valid() {
            Ok(())
        } else {
            Err(QuasarError::Validation(format!(
                "{what} must set both limit and unit"
            )))
        }
    }
}
