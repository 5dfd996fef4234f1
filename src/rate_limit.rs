//! Client-side pacing for provider uploads, written as `N/s`, `N/m` or `N/h`.
//!
//! This is separate from the monthly quota. The quota decides *whether* we may
//! call the primary provider at all; a rate limit only spaces calls out so a
//! batch scan doesn't trip the provider's HTTP 429 throttling.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The window a [`RateLimit`] is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
    Hour,
}

impl RateLimitPeriod {
    /// The length of this window.
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
            RateLimitPeriod::Hour => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
            RateLimitPeriod::Hour => write!(f, "h"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            "h" => Ok(RateLimitPeriod::Hour),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// How many uploads we may start per period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a new [`RateLimit`].
    pub fn new(max_requests: usize, per_period: RateLimitPeriod) -> Self {
        Self {
            max_requests,
            per_period,
        }
    }

    /// Build a limiter that hands out one token every `period / max_requests`.
    ///
    /// The bucket starts full, so a short batch runs at full speed and only a
    /// long one gets paced.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        let max = self.max_requests.max(1);
        let interval = self.per_period.to_duration() / u32::try_from(max).unwrap_or(u32::MAX);
        RateLimiter::builder()
            .initial(max)
            .refill(1)
            .max(max)
            .interval(interval.max(Duration::from_millis(1)))
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (count, period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("Expected COUNT/PERIOD"))?;
            let max_requests = count.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("Rate limit must allow at least one request"));
            }
            let per_period = period.trim().parse::<RateLimitPeriod>()?;
            Ok(Self::new(max_requests, per_period))
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}
