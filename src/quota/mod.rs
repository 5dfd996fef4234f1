//! The monthly quota gate for the primary provider.
//!
//! We count primary-provider uploads per calendar month and refuse to call
//! the provider once the limit is reached, so that scans go straight to the
//! fallback provider instead of failing there first.
//!
//! Admission and usage recording are separate calls, so two scans can both be
//! admitted at `limit - 1` and both increment. The counter may therefore
//! overshoot `limit` by at most (concurrent scans - 1) before admission starts
//! denying. The provider's own quota response remains authoritative; this
//! tracker just avoids calls we already know will fail.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use schemars::JsonSchema;

use crate::prelude::*;

use self::store::{CounterStore, StoreResult};

pub mod file_store;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

/// The default number of primary-provider calls allowed per month.
pub const DEFAULT_QUOTA_LIMIT: u64 = 200;

/// The default usage at which we start warning.
pub const DEFAULT_WARNING_THRESHOLD: u64 = 180;

/// Prefix for counter keys in the store.
const KEY_PREFIX: &str = "scan-reconcile:usage:";

/// Counters expire a little after their month closes, so stale keys are
/// reclaimed without any cleanup job.
const COUNTER_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 32);

/// The month key (`YYYY-MM`, UTC) for a point in time.
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Quota limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Calls allowed per month.
    pub limit: u64,

    /// Usage at which callers get a warning flag.
    pub warning_threshold: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUOTA_LIMIT,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}

/// What to do when the counter store can't be read during admission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum StoreFailurePolicy {
    /// Admit the scan and let the provider's quota response decide.
    #[default]
    FailOpen,

    /// Deny the scan, which sends it to the fallback provider.
    FailClosed,
}

/// The result of an admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The primary provider may be called.
    Allowed,

    /// The monthly quota is used up.
    Denied,
}

/// How a successful upload should be billed against the quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Billing {
    /// A normal upload, which counts.
    Billable,

    /// The provider recognized the image as already processed this period.
    /// These are free.
    Duplicate,
}

/// Usage after recording an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageRecord {
    /// The counter value after this call.
    pub count: u64,

    /// Did this call bring usage to or past the warning threshold?
    pub is_warning: bool,

    /// Did this call increment the counter?
    pub counted: bool,
}

/// A read-only usage snapshot, for reporting.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    /// Calls recorded this month.
    pub usage: u64,

    /// Calls allowed per month.
    pub limit: u64,

    /// Usage at which we start warning.
    pub warning_threshold: u64,

    /// Is admission currently denied?
    pub is_blocked: bool,

    /// Has usage reached the warning threshold?
    pub is_warning: bool,

    /// The month this snapshot covers (`YYYY-MM`).
    pub month_key: String,
}

/// Tracks primary-provider usage against the monthly limit.
pub struct QuotaTracker {
    store: Arc<dyn CounterStore>,
    limits: QuotaLimits,
    failure_policy: StoreFailurePolicy,
}

impl QuotaTracker {
    /// Create a new tracker.
    pub fn new(
        store: Arc<dyn CounterStore>,
        limits: QuotaLimits,
        failure_policy: StoreFailurePolicy,
    ) -> Self {
        if limits.warning_threshold > limits.limit {
            warn!(
                limit = limits.limit,
                warning_threshold = limits.warning_threshold,
                "Quota warning threshold is above the limit and will never fire first"
            );
        }
        Self {
            store,
            limits,
            failure_policy,
        }
    }

    fn store_key(month_key: &str) -> String {
        format!("{KEY_PREFIX}{month_key}")
    }

    /// May we call the primary provider this month?
    ///
    /// If the store is unreachable, the [`StoreFailurePolicy`] decides.
    #[instrument(level = "debug", skip(self))]
    pub async fn admit(&self, month_key: &str) -> Admission {
        match self.store.get(&Self::store_key(month_key)).await {
            Ok(count) if count >= self.limits.limit => {
                warn!(
                    count,
                    limit = self.limits.limit,
                    "Monthly quota reached, denying primary provider"
                );
                Admission::Denied
            }
            Ok(_) => Admission::Allowed,
            Err(err) => match self.failure_policy {
                StoreFailurePolicy::FailOpen => {
                    warn!(%err, "Quota store unavailable, admitting (fail open)");
                    Admission::Allowed
                }
                StoreFailurePolicy::FailClosed => {
                    warn!(%err, "Quota store unavailable, denying (fail closed)");
                    Admission::Denied
                }
            },
        }
    }

    /// Record one successful upload.
    ///
    /// Duplicates are free: the counter is read but not incremented. The
    /// warning flag follows the count either way. The first increment of a
    /// month sets the counter's expiry.
    #[instrument(level = "debug", skip(self))]
    pub async fn record_usage(
        &self,
        month_key: &str,
        billing: Billing,
    ) -> StoreResult<UsageRecord> {
        let key = Self::store_key(month_key);
        if billing == Billing::Duplicate {
            let count = self.store.get(&key).await?;
            debug!(count, "Duplicate upload, not counted");
            return Ok(UsageRecord {
                count,
                is_warning: count >= self.limits.warning_threshold,
                counted: false,
            });
        }

        let count = self.store.incr(&key).await?;
        if count == 1 {
            if let Err(err) = self.store.expire(&key, COUNTER_TTL).await {
                // The counter is still right; it just won't clean itself up.
                warn!(%err, "Could not set quota counter expiry");
            }
        }
        let is_warning = count >= self.limits.warning_threshold;
        if is_warning {
            warn!(
                count,
                limit = self.limits.limit,
                "Approaching monthly primary provider limit"
            );
        }
        Ok(UsageRecord {
            count,
            is_warning,
            counted: true,
        })
    }

    /// A usage snapshot for reporting.
    pub async fn current_usage(&self, month_key: &str) -> StoreResult<QuotaStatus> {
        let usage = self.store.get(&Self::store_key(month_key)).await?;
        Ok(QuotaStatus {
            usage,
            limit: self.limits.limit,
            warning_threshold: self.limits.warning_threshold,
            is_blocked: usage >= self.limits.limit,
            is_warning: usage >= self.limits.warning_threshold,
            month_key: month_key.to_owned(),
        })
    }

    /// Overwrite this month's usage.
    pub async fn set_usage(&self, month_key: &str, usage: u64) -> StoreResult<()> {
        let key = Self::store_key(month_key);
        self.store.set(&key, usage).await?;
        self.store.expire(&key, COUNTER_TTL).await
    }
}
