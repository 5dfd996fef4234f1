//! Command-line and environment configuration, and the code that turns it
//! into a running [`ScanService`].

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use clap::Args;

use crate::{
    catalog::CatalogProvider,
    orchestrator::{BackoffSchedule, PollingOrchestrator},
    prelude::*,
    providers::{
        build_http_client,
        fallback::{self, OcrSpaceClient},
        primary::{self, TabscannerClient},
    },
    quota::{
        DEFAULT_QUOTA_LIMIT, DEFAULT_WARNING_THRESHOLD, QuotaLimits, QuotaTracker,
        StoreFailurePolicy,
        file_store::FileCounterStore,
        store::{CounterStore, MemoryCounterStore},
    },
    rate_limit::RateLimit,
    reconcile::ReconciliationEngine,
    service::ScanService,
};

/// Where to keep the monthly usage counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CounterStoreSpec {
    /// In process memory. Forgotten on exit.
    Memory,
    /// A small JSON file on disk.
    File(PathBuf),
    /// A Redis server, shared between processes.
    Redis(String),
}

impl CounterStoreSpec {
    /// Open the store.
    pub async fn open(&self) -> Result<Arc<dyn CounterStore>> {
        match self {
            CounterStoreSpec::Memory => Ok(Arc::new(MemoryCounterStore::new())),
            CounterStoreSpec::File(path) => {
                let store = FileCounterStore::new(path);
                debug!(path = %store.path().display(), "Using file counter store");
                Ok(Arc::new(store))
            }
            #[cfg(feature = "redis")]
            CounterStoreSpec::Redis(url) => {
                let store = crate::quota::redis_store::RedisCounterStore::new(url)
                    .await
                    .with_context(|| format!("could not connect to {url}"))?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis"))]
            CounterStoreSpec::Redis(url) => Err(anyhow!(
                "counter store {url} needs a build with the `redis` feature"
            )),
        }
    }
}

impl FromStr for CounterStoreSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "memory" {
            Ok(CounterStoreSpec::Memory)
        } else if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err(anyhow!("missing path in counter store {s:?}"));
            }
            Ok(CounterStoreSpec::File(PathBuf::from(path)))
        } else if s.starts_with("redis://") || s.starts_with("rediss://") {
            Ok(CounterStoreSpec::Redis(s.to_owned()))
        } else {
            Err(anyhow!(
                "unknown counter store {s:?} (expected \"memory\", \"file:PATH\" or \"redis://...\")"
            ))
        }
    }
}

impl fmt::Display for CounterStoreSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterStoreSpec::Memory => write!(f, "memory"),
            CounterStoreSpec::File(path) => write!(f, "file:{}", path.display()),
            CounterStoreSpec::Redis(url) => write!(f, "{url}"),
        }
    }
}

/// OCR provider options.
#[derive(Clone, Debug, Args)]
pub struct ProviderOpts {
    /// API key for the primary invoice provider.
    #[clap(long, env = "TABSCANNER_API_KEY", hide_env_values = true)]
    pub tabscanner_api_key: Option<String>,

    /// Base URL for the primary invoice provider.
    #[clap(long, env = "TABSCANNER_API_BASE", default_value = primary::DEFAULT_API_BASE)]
    pub tabscanner_api_base: String,

    /// API key for the fallback text provider. Defaults to the public demo key.
    #[clap(
        long,
        env = "OCR_SPACE_API_KEY",
        hide_env_values = true,
        default_value = fallback::DEMO_API_KEY
    )]
    pub ocr_space_api_key: String,

    /// Endpoint for the fallback text provider.
    #[clap(long, env = "OCR_SPACE_API_BASE", default_value = fallback::DEFAULT_API_BASE)]
    pub ocr_space_api_base: String,

    /// HTTP timeout for provider requests, in seconds.
    #[clap(long = "timeout", default_value = "60")]
    pub timeout_secs: u64,

    /// How many times to poll the primary provider before giving up.
    #[clap(long, default_value = "12")]
    pub max_poll_attempts: u32,

    /// A rate limit for primary provider requests, of the form "10/s" or
    /// "60/m". This is applied separately from `--jobs`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,
}

/// Quota options.
#[derive(Clone, Debug, Args)]
pub struct QuotaOpts {
    /// Monthly number of billable primary provider scans.
    #[clap(long, env = "SCAN_QUOTA_LIMIT", default_value_t = DEFAULT_QUOTA_LIMIT)]
    pub quota_limit: u64,

    /// Usage at which to start warning.
    #[clap(long, env = "SCAN_QUOTA_WARNING", default_value_t = DEFAULT_WARNING_THRESHOLD)]
    pub quota_warning: u64,

    /// Where to keep the usage counter: "memory", "file:PATH" or a Redis URL.
    #[clap(long, env = "SCAN_COUNTER_STORE", default_value = "file:scan-usage.json")]
    pub counter_store: CounterStoreSpec,

    /// What to do when the counter store can't be read.
    #[clap(
        long,
        env = "SCAN_STORE_FAILURE_POLICY",
        value_enum,
        default_value = "fail-open"
    )]
    pub store_failure_policy: StoreFailurePolicy,
}

impl QuotaOpts {
    /// Build a quota tracker.
    pub async fn build_tracker(&self) -> Result<QuotaTracker> {
        let store = self.counter_store.open().await?;
        debug!(store = %self.counter_store, "Opened counter store");
        Ok(QuotaTracker::new(
            store,
            QuotaLimits {
                limit: self.quota_limit,
                warning_threshold: self.quota_warning,
            },
            self.store_failure_policy,
        ))
    }
}

/// Build an orchestrator talking to the real providers.
pub async fn build_orchestrator(
    provider_opts: &ProviderOpts,
    quota_opts: &QuotaOpts,
) -> Result<PollingOrchestrator> {
    let http = build_http_client(Duration::from_secs(provider_opts.timeout_secs))?;
    if provider_opts.tabscanner_api_key.is_none() {
        warn!("TABSCANNER_API_KEY is not set, so invoice scans will fail until it is");
    }
    let primary = TabscannerClient::new(
        http.clone(),
        &provider_opts.tabscanner_api_base,
        provider_opts.tabscanner_api_key.clone(),
        provider_opts.rate_limit.as_ref(),
    );
    let fallback = OcrSpaceClient::new(
        http,
        &provider_opts.ocr_space_api_base,
        &provider_opts.ocr_space_api_key,
    );
    let quota = quota_opts.build_tracker().await?;
    let backoff = BackoffSchedule {
        max_attempts: provider_opts.max_poll_attempts.max(1),
        ..BackoffSchedule::default()
    };
    debug!(ceiling_secs = backoff.ceiling().as_secs_f64(), "Polling schedule");
    Ok(
        PollingOrchestrator::new(Arc::new(quota), Arc::new(primary), Arc::new(fallback))
            .with_backoff(backoff),
    )
}

/// Build the whole service.
pub async fn build_service(
    provider_opts: &ProviderOpts,
    quota_opts: &QuotaOpts,
    catalog: Arc<dyn CatalogProvider>,
) -> Result<ScanService> {
    let orchestrator = build_orchestrator(provider_opts, quota_opts).await?;
    Ok(ScanService::new(
        Arc::new(orchestrator),
        catalog,
        ReconciliationEngine::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter_store() {
        assert_eq!(
            "memory".parse::<CounterStoreSpec>().unwrap(),
            CounterStoreSpec::Memory
        );
        assert_eq!(
            "file:/tmp/usage.json".parse::<CounterStoreSpec>().unwrap(),
            CounterStoreSpec::File(PathBuf::from("/tmp/usage.json"))
        );
        assert_eq!(
            "redis://localhost:6379/0".parse::<CounterStoreSpec>().unwrap(),
            CounterStoreSpec::Redis("redis://localhost:6379/0".to_owned())
        );
    }

    #[test]
    fn test_failed_parse_counter_store() {
        assert!("".parse::<CounterStoreSpec>().is_err());
        assert!("file:".parse::<CounterStoreSpec>().is_err());
        assert!("postgres://db".parse::<CounterStoreSpec>().is_err());
    }

    #[test]
    fn test_display_counter_store() {
        for s in ["memory", "file:usage.json", "redis://cache:6379"] {
            assert_eq!(s.parse::<CounterStoreSpec>().unwrap().to_string(), s);
        }
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = CounterStoreSpec::Memory.open().await.unwrap();
        assert_eq!(store.incr("k").await.unwrap(), 1);
    }
}
