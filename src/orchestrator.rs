//! The scan state machine.
//!
//! A scan moves through these states:
//!
//! ```text
//! Admitting ──denied──────────────────────────────┐
//!     │                                           v
//! Uploading ──provider quota──────────────────> Fallback ──> FallbackAttempted
//!     │                                           ^
//! Polling ──provider quota────────────────────────┘
//!     │
//!     ├──> Done
//!     ├──> Failed
//!     └──> TimedOut
//! ```
//!
//! Each call to [`PollingOrchestrator::advance`] performs at most one network
//! call (plus, when polling, the backoff sleep before it). Sleeping goes
//! through an injected [`Clock`], so tests can check the backoff schedule
//! without waiting for it.
//!
//! Usage is recorded exactly once, right after a successful upload. Dropping
//! the future returned by [`PollingOrchestrator::run`] cancels the scan; any
//! usage already recorded stands.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::{
    error::{ScanError, ScanErrorKind},
    image::ScanImage,
    items::{ExtractedLineItem, parse_fallback_text},
    prelude::*,
    providers::{
        ProviderKind, ProviderResponse,
        fallback::{FallbackOcrClient, TextMode},
        primary::{PollStatus, PrimaryOcrClient},
    },
    quota::{Admission, Billing, QuotaTracker, month_key},
};

/// Time and sleeping.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How long to wait before each poll.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffSchedule {
    /// Delay before the first poll.
    pub initial_delay: Duration,

    /// Growth factor between polls.
    pub multiplier: f64,

    /// No delay is longer than this.
    pub max_delay: Duration,

    /// How many polls to make before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(8000),
            max_attempts: 12,
        }
    }
}

impl BackoffSchedule {
    /// The delay before poll number `attempt`, counting from 1.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Every delay in the schedule, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_before(attempt))
    }

    /// The total time spent sleeping if every poll comes back pending.
    pub fn ceiling(&self) -> Duration {
        self.delays().sum()
    }
}

/// Where a primary-provider job stands.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// An attempt to move a job out of a terminal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("scan job cannot go from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl From<InvalidTransition> for ScanError {
    fn from(err: InvalidTransition) -> Self {
        ScanError::new(ScanErrorKind::ProviderError, err.to_string())
    }
}

/// A primary-provider job, owned by the scan that uploaded it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanJob {
    pub token: String,
    pub provider: ProviderKind,
    status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

impl ScanJob {
    /// A freshly uploaded job.
    pub fn new(token: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            provider: ProviderKind::Primary,
            status: JobStatus::Pending,
            created_at,
            attempts: 0,
        }
    }

    /// The current status.
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move to a new status. Terminal statuses are final.
    pub fn transition(&mut self, to: JobStatus) -> std::result::Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Usage information gathered at upload time, carried to the final outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageSignal {
    /// The provider had already processed this image, so it was free.
    pub cached: bool,

    /// Usage has reached the warning threshold.
    pub warning: bool,

    /// The counter after this upload, if we could record it.
    pub usage_count: Option<u64>,
}

/// Why a scan went to the fallback provider.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Our own quota tracker denied admission.
    LocalQuotaDenied,
    /// The primary provider reported its quota exhausted.
    ProviderQuotaExceeded,
}

/// What happened on the fallback path.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackReport {
    pub reason: FallbackReason,

    /// Set if the fallback call itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScanErrorKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The line items a scan produced, and how it got them.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutcome {
    pub items: Vec<ExtractedLineItem>,

    /// Which provider the items came from.
    pub source: ProviderKind,

    /// The primary provider had seen this image before (no usage charged).
    pub cached: bool,

    /// Monthly usage has reached the warning threshold.
    pub warning: bool,

    /// Primary-provider usage after this scan, if it was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<u64>,

    /// Present if the fallback provider was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackReport>,

    /// We couldn't read anything, and `items` holds a placeholder.
    pub manual_entry_required: bool,
}

/// A scan in progress.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanState {
    Admitting,
    Uploading,
    Polling { job: ScanJob, usage: UsageSignal },
    Fallback { reason: FallbackReason, usage: UsageSignal },
    Done(ExtractionOutcome),
    FallbackAttempted(ExtractionOutcome),
    Failed(ScanError),
    TimedOut { attempts: u32 },
}

impl ScanState {
    /// Is the scan over?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Done(_)
                | ScanState::FallbackAttempted(_)
                | ScanState::Failed(_)
                | ScanState::TimedOut { .. }
        )
    }

    /// Turn a terminal state into the scan's result.
    pub fn into_result(self) -> std::result::Result<ExtractionOutcome, ScanError> {
        match self {
            ScanState::Done(outcome) | ScanState::FallbackAttempted(outcome) => Ok(outcome),
            ScanState::Failed(err) => Err(err),
            ScanState::TimedOut { attempts } => Err(ScanError::new(
                ScanErrorKind::Timeout,
                format!("job still pending after {attempts} polls"),
            )),
            other => Err(ScanError::new(
                ScanErrorKind::ProviderError,
                format!("scan stopped in non-terminal state {other}"),
            )),
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Admitting => "ADMITTING",
            ScanState::Uploading => "UPLOADING",
            ScanState::Polling { .. } => "POLLING",
            ScanState::Fallback { .. } => "FALLBACK",
            ScanState::Done(_) => "DONE",
            ScanState::FallbackAttempted(_) => "FALLBACK_ATTEMPTED",
            ScanState::Failed(_) => "FAILED",
            ScanState::TimedOut { .. } => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// The result of [`PollingOrchestrator::submit`].
#[derive(Clone, Debug, PartialEq)]
pub enum Submission {
    /// Uploaded. Poll the job to get the items.
    Queued { job: ScanJob, usage: UsageSignal },
    /// Finished without polling (the fallback path).
    Completed(ExtractionOutcome),
}

fn provider_error<T>(response: &ProviderResponse<T>) -> ScanError {
    ScanError::new(
        response.error_kind().unwrap_or(ScanErrorKind::ProviderError),
        response.error_message().unwrap_or_default(),
    )
}

/// Drives scans through the state machine.
pub struct PollingOrchestrator {
    quota: Arc<QuotaTracker>,
    primary: Arc<dyn PrimaryOcrClient>,
    fallback: Arc<dyn FallbackOcrClient>,
    clock: Arc<dyn Clock>,
    backoff: BackoffSchedule,
}

impl PollingOrchestrator {
    /// Create an orchestrator using the system clock and default backoff.
    pub fn new(
        quota: Arc<QuotaTracker>,
        primary: Arc<dyn PrimaryOcrClient>,
        fallback: Arc<dyn FallbackOcrClient>,
    ) -> Self {
        Self {
            quota,
            primary,
            fallback,
            clock: Arc::new(SystemClock),
            backoff: BackoffSchedule::default(),
        }
    }

    /// Use a different clock.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different backoff schedule.
    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn fallback_client(&self) -> &dyn FallbackOcrClient {
        self.fallback.as_ref()
    }

    /// The month key for right now.
    pub fn current_month_key(&self) -> String {
        month_key(self.clock.now())
    }

    /// Take one step.
    #[instrument(level = "debug", skip_all, fields(state = %state))]
    pub async fn advance(&self, state: ScanState, image: &ScanImage, month_key: &str) -> ScanState {
        match state {
            ScanState::Admitting => match self.quota.admit(month_key).await {
                Admission::Allowed => ScanState::Uploading,
                Admission::Denied => {
                    warn!("Local quota exhausted, using fallback provider");
                    ScanState::Fallback {
                        reason: FallbackReason::LocalQuotaDenied,
                        usage: UsageSignal::default(),
                    }
                }
            },
            ScanState::Uploading => self.upload(image, month_key).await,
            ScanState::Polling { job, usage } => self.poll_once(job, usage).await,
            ScanState::Fallback { reason, usage } => self.run_fallback(image, reason, usage).await,
            terminal => terminal,
        }
    }

    async fn upload(&self, image: &ScanImage, month_key: &str) -> ScanState {
        let response = self.primary.upload(image).await;
        let receipt = match response {
            ProviderResponse::Success(receipt) => receipt,
            ProviderResponse::QuotaError { message } => {
                warn!(%message, "Primary provider quota exceeded, using fallback provider");
                return ScanState::Fallback {
                    reason: FallbackReason::ProviderQuotaExceeded,
                    usage: UsageSignal::default(),
                };
            }
            other => {
                let err = provider_error(&other);
                error!(%err, "Primary provider upload failed");
                return ScanState::Failed(err);
            }
        };

        let billing = if receipt.duplicate {
            Billing::Duplicate
        } else {
            Billing::Billable
        };
        let usage = match self.quota.record_usage(month_key, billing).await {
            Ok(record) => UsageSignal {
                cached: receipt.duplicate,
                warning: record.is_warning,
                usage_count: Some(record.count),
            },
            Err(err) => {
                // The upload happened, so the scan goes on.
                error!(%err, "Could not record primary provider usage");
                UsageSignal {
                    cached: receipt.duplicate,
                    ..UsageSignal::default()
                }
            }
        };
        debug!(token = %receipt.token, cached = usage.cached, "Uploaded to primary provider");
        ScanState::Polling {
            job: ScanJob::new(receipt.token, self.clock.now()),
            usage,
        }
    }

    async fn poll_once(&self, mut job: ScanJob, usage: UsageSignal) -> ScanState {
        if job.attempts >= self.backoff.max_attempts {
            warn!(
                token = %job.token,
                attempts = job.attempts,
                waited_secs = self.backoff.ceiling().as_secs_f64(),
                "Gave up polling"
            );
            return ScanState::TimedOut {
                attempts: job.attempts,
            };
        }

        let attempt = job.attempts + 1;
        let delay = self.backoff.delay_before(attempt);
        debug!(token = %job.token, attempt, delay_ms = delay.as_millis(), "Waiting to poll");
        self.clock.sleep(delay).await;
        job.attempts = attempt;

        let next = match self.primary.poll(&job.token).await {
            ProviderResponse::Success(PollStatus::Pending) => JobStatus::Pending,
            ProviderResponse::Success(PollStatus::Processing) => JobStatus::Processing,
            ProviderResponse::Success(PollStatus::Done(items)) => {
                if let Err(err) = job.transition(JobStatus::Done) {
                    return ScanState::Failed(err.into());
                }
                info!(token = %job.token, attempts = job.attempts, items = items.len(), "Scan done");
                return ScanState::Done(ExtractionOutcome {
                    items,
                    source: ProviderKind::Primary,
                    cached: usage.cached,
                    warning: usage.warning,
                    usage_count: usage.usage_count,
                    fallback: None,
                    manual_entry_required: false,
                });
            }
            ProviderResponse::Success(PollStatus::Failed { message }) => {
                if let Err(err) = job.transition(JobStatus::Failed) {
                    return ScanState::Failed(err.into());
                }
                error!(token = %job.token, %message, "Primary provider rejected the document");
                return ScanState::Failed(ScanError::new(ScanErrorKind::OcrFailed, message));
            }
            ProviderResponse::QuotaError { message } => {
                warn!(%message, "Primary provider quota exceeded while polling, using fallback provider");
                return ScanState::Fallback {
                    reason: FallbackReason::ProviderQuotaExceeded,
                    usage,
                };
            }
            ProviderResponse::InvalidKey { message } => {
                error!(%message, "Primary provider rejected our API key");
                return ScanState::Failed(ScanError::new(ScanErrorKind::InvalidApiKey, message));
            }
            ProviderResponse::RateLimited { message } => {
                warn!(token = %job.token, %message, "Primary provider rate limited polling");
                return ScanState::Failed(ScanError::new(ScanErrorKind::RateLimit, message));
            }
            ProviderResponse::GenericError { message } => {
                warn!(attempt, %message, "Poll failed, will try again");
                job.status()
            }
        };
        if let Err(err) = job.transition(next) {
            return ScanState::Failed(err.into());
        }
        ScanState::Polling { job, usage }
    }

    async fn run_fallback(
        &self,
        image: &ScanImage,
        reason: FallbackReason,
        usage: UsageSignal,
    ) -> ScanState {
        let response = self.fallback.recognize_text(image, TextMode::Document).await;
        let (items, error, detail) = match response {
            ProviderResponse::Success(text) => {
                let items = parse_fallback_text(&text);
                if items.is_empty() {
                    warn!("Fallback text had no priced lines");
                    (items, None, Some("no priced lines found".to_owned()))
                } else {
                    (items, None, None)
                }
            }
            other => {
                let err = provider_error(&other);
                error!(%err, "Fallback provider failed");
                (vec![], Some(err.kind()), Some(err.detail().to_owned()))
            }
        };
        let manual_entry_required = items.is_empty();
        let items = if manual_entry_required {
            vec![ExtractedLineItem::manual_entry_placeholder()]
        } else {
            items
        };
        ScanState::FallbackAttempted(ExtractionOutcome {
            items,
            source: ProviderKind::Fallback,
            cached: usage.cached,
            warning: usage.warning,
            usage_count: usage.usage_count,
            fallback: Some(FallbackReport {
                reason,
                error,
                detail,
            }),
            manual_entry_required,
        })
    }

    async fn drive(
        &self,
        mut state: ScanState,
        image: &ScanImage,
        month_key: &str,
        stop_at_polling: bool,
    ) -> ScanState {
        while !state.is_terminal() {
            if stop_at_polling && matches!(state, ScanState::Polling { .. }) {
                break;
            }
            state = self.advance(state, image, month_key).await;
        }
        state
    }

    /// Run a whole invoice scan.
    #[instrument(level = "debug", skip_all, fields(image = ?image))]
    pub async fn run(&self, image: &ScanImage) -> std::result::Result<ExtractionOutcome, ScanError> {
        let month_key = self.current_month_key();
        self.drive(ScanState::Admitting, image, &month_key, false)
            .await
            .into_result()
    }

    /// Admit and upload, but don't poll.
    ///
    /// Quota-driven fallbacks still run to completion here, since they don't
    /// produce a job.
    #[instrument(level = "debug", skip_all, fields(image = ?image))]
    pub async fn submit(&self, image: &ScanImage) -> std::result::Result<Submission, ScanError> {
        let month_key = self.current_month_key();
        match self
            .drive(ScanState::Admitting, image, &month_key, true)
            .await
        {
            ScanState::Polling { job, usage } => Ok(Submission::Queued { job, usage }),
            terminal => terminal.into_result().map(Submission::Completed),
        }
    }

    /// Poll a job once, without waiting.
    #[instrument(level = "debug", skip(self))]
    pub async fn check_job(&self, token: &str) -> std::result::Result<PollStatus, ScanError> {
        match self.primary.poll(token).await {
            ProviderResponse::Success(PollStatus::Failed { message }) => {
                Err(ScanError::new(ScanErrorKind::OcrFailed, message))
            }
            ProviderResponse::Success(status) => Ok(status),
            other => Err(provider_error(&other)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use chrono::TimeZone as _;

    use super::*;
    use crate::providers::primary::UploadReceipt;
    use crate::quota::{
        QuotaLimits, StoreFailurePolicy,
        store::{CounterStore, MemoryCounterStore},
        tests::{UnavailableStore, memory_tracker},
    };

    /// A clock that never really sleeps, but remembers what it was asked.
    #[derive(Default)]
    pub(crate) struct ManualClock {
        pub(crate) sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            tokio::task::yield_now().await;
        }
    }

    impl ManualClock {
        fn total_sleep(&self) -> Duration {
            self.sleeps.lock().unwrap().iter().sum()
        }
    }

    /// A primary provider with scripted answers. Polls past the end of the
    /// script are pending.
    pub(crate) struct FakePrimary {
        pub(crate) upload_response: ProviderResponse<UploadReceipt>,
        pub(crate) polls: Mutex<VecDeque<ProviderResponse<PollStatus>>>,
        pub(crate) uploads: AtomicUsize,
        pub(crate) poll_count: AtomicUsize,
    }

    impl FakePrimary {
        pub(crate) fn new(
            upload_response: ProviderResponse<UploadReceipt>,
            polls: Vec<ProviderResponse<PollStatus>>,
        ) -> Self {
            Self {
                upload_response,
                polls: Mutex::new(polls.into()),
                uploads: AtomicUsize::new(0),
                poll_count: AtomicUsize::new(0),
            }
        }

        pub(crate) fn accepting(duplicate: bool, polls: Vec<ProviderResponse<PollStatus>>) -> Self {
            Self::new(
                ProviderResponse::Success(UploadReceipt {
                    token: "job-1".to_owned(),
                    duplicate,
                    message: None,
                }),
                polls,
            )
        }
    }

    #[async_trait]
    impl PrimaryOcrClient for FakePrimary {
        async fn upload(&self, _image: &ScanImage) -> ProviderResponse<UploadReceipt> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            self.upload_response.clone()
        }

        async fn poll(&self, _token: &str) -> ProviderResponse<PollStatus> {
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProviderResponse::Success(PollStatus::Pending))
        }
    }

    /// A fallback provider with one fixed answer.
    pub(crate) struct FakeFallback {
        pub(crate) response: ProviderResponse<String>,
        pub(crate) calls: Mutex<Vec<TextMode>>,
    }

    impl FakeFallback {
        pub(crate) fn new(response: ProviderResponse<String>) -> Self {
            Self {
                response,
                calls: Mutex::new(vec![]),
            }
        }

        pub(crate) fn text(text: &str) -> Self {
            Self::new(ProviderResponse::Success(text.to_owned()))
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FallbackOcrClient for FakeFallback {
        async fn recognize_text(
            &self,
            _image: &ScanImage,
            mode: TextMode,
        ) -> ProviderResponse<String> {
            self.calls.lock().unwrap().push(mode);
            self.response.clone()
        }
    }

    struct Harness {
        orchestrator: PollingOrchestrator,
        primary: Arc<FakePrimary>,
        fallback: Arc<FakeFallback>,
        clock: Arc<ManualClock>,
        quota: Arc<QuotaTracker>,
    }

    fn harness_with_quota(
        quota: Arc<QuotaTracker>,
        primary: FakePrimary,
        fallback: FakeFallback,
    ) -> Harness {
        let primary = Arc::new(primary);
        let fallback = Arc::new(fallback);
        let clock = Arc::new(ManualClock::default());
        let orchestrator = PollingOrchestrator::new(quota.clone(), primary.clone(), fallback.clone())
            .with_clock(clock.clone());
        Harness {
            orchestrator,
            primary,
            fallback,
            clock,
            quota,
        }
    }

    fn harness(primary: FakePrimary, fallback: FakeFallback) -> Harness {
        harness_with_quota(Arc::new(memory_tracker()), primary, fallback)
    }

    fn image() -> ScanImage {
        ScanImage::new(b"fake jpeg".to_vec())
    }

    const MONTH: &str = "2026-10";

    fn done(items: Vec<ExtractedLineItem>) -> ProviderResponse<PollStatus> {
        ProviderResponse::Success(PollStatus::Done(items))
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = BackoffSchedule::default();
        let delays: Vec<u128> = backoff.delays().map(|d| d.as_millis()).collect();
        assert_eq!(
            delays,
            vec![2000, 3000, 4500, 6750, 8000, 8000, 8000, 8000, 8000, 8000, 8000, 8000]
        );
        assert_eq!(backoff.ceiling(), Duration::from_millis(80_250));
        assert!(backoff.ceiling() < Duration::from_secs(120));
    }

    #[test]
    fn test_terminal_jobs_stay_terminal() {
        let mut job = ScanJob::new("t", Utc::now());
        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Done).unwrap();
        assert_eq!(
            job.transition(JobStatus::Pending),
            Err(InvalidTransition {
                from: JobStatus::Done,
                to: JobStatus::Pending
            })
        );
        assert_eq!(job.status(), JobStatus::Done);
    }

    #[tokio::test]
    async fn test_happy_path_records_usage_once() {
        let items = vec![ExtractedLineItem::single("FILTRO OLEO", 32.5)];
        let h = harness(
            FakePrimary::accepting(
                false,
                vec![
                    ProviderResponse::Success(PollStatus::Pending),
                    ProviderResponse::Success(PollStatus::Processing),
                    done(items.clone()),
                ],
            ),
            FakeFallback::text(""),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(outcome.items, items);
        assert_eq!(outcome.source, ProviderKind::Primary);
        assert!(!outcome.cached);
        assert_eq!(outcome.usage_count, Some(1));
        assert_eq!(h.quota.current_usage(MONTH).await.unwrap().usage, 1);
        assert_eq!(h.primary.poll_count.load(Ordering::SeqCst), 3);
        assert_eq!(h.fallback.call_count(), 0);
        assert_eq!(
            *h.clock.sleeps.lock().unwrap(),
            vec![
                Duration::from_millis(2000),
                Duration::from_millis(3000),
                Duration::from_millis(4500)
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_upload_is_free() {
        let h = harness(
            FakePrimary::accepting(true, vec![done(vec![])]),
            FakeFallback::text(""),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert!(outcome.cached);
        assert!(!outcome.warning);
        assert_eq!(h.quota.current_usage(MONTH).await.unwrap().usage, 0);
    }

    #[tokio::test]
    async fn test_denied_admission_skips_primary() {
        let h = harness(
            FakePrimary::accepting(false, vec![done(vec![])]),
            FakeFallback::text("OLEO 5W30 SINTET   45,00\nobrigado"),
        );
        h.quota.set_usage(MONTH, 199).await.unwrap();

        // The 200th call is admitted and counted.
        let first = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(first.source, ProviderKind::Primary);
        assert_eq!(first.usage_count, Some(200));
        assert!(first.warning);
        assert_eq!(h.quota.admit(MONTH).await, Admission::Denied);

        // The next one goes straight to the fallback.
        let second = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(h.primary.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(second.source, ProviderKind::Fallback);
        assert_eq!(
            second.items,
            vec![ExtractedLineItem::single("OLEO 5W30 SINTET", 45.0)]
        );
        assert_eq!(
            second.fallback,
            Some(FallbackReport {
                reason: FallbackReason::LocalQuotaDenied,
                error: None,
                detail: None,
            })
        );
        assert_eq!(*h.fallback.calls.lock().unwrap(), vec![TextMode::Document]);
        assert_eq!(h.quota.current_usage(MONTH).await.unwrap().usage, 200);
    }

    #[tokio::test]
    async fn test_pending_forever_times_out_without_fallback() {
        let h = harness(FakePrimary::accepting(false, vec![]), FakeFallback::text("X 1,00"));
        let err = h.orchestrator.run(&image()).await.unwrap_err();
        assert_eq!(err.kind(), ScanErrorKind::Timeout);
        assert_eq!(h.primary.poll_count.load(Ordering::SeqCst), 12);
        assert_eq!(h.clock.total_sleep(), BackoffSchedule::default().ceiling());
        assert_eq!(h.fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_quota_on_upload_falls_back() {
        let h = harness(
            FakePrimary::new(
                ProviderResponse::QuotaError {
                    message: "Limit Exceeded".to_owned(),
                },
                vec![],
            ),
            FakeFallback::text("PASTILHA FREIO 120,00"),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(outcome.source, ProviderKind::Fallback);
        assert_eq!(
            outcome.fallback.as_ref().map(|f| f.reason),
            Some(FallbackReason::ProviderQuotaExceeded)
        );
        assert!(!outcome.manual_entry_required);
        assert_eq!(h.quota.current_usage(MONTH).await.unwrap().usage, 0);
    }

    #[tokio::test]
    async fn test_provider_quota_while_polling_falls_back() {
        let h = harness(
            FakePrimary::accepting(
                false,
                vec![ProviderResponse::QuotaError {
                    message: "quota".to_owned(),
                }],
            ),
            FakeFallback::text("VELA 15,00"),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(outcome.source, ProviderKind::Fallback);
        // The upload itself still counted.
        assert_eq!(outcome.usage_count, Some(1));
    }

    #[tokio::test]
    async fn test_rejected_document_is_terminal() {
        let h = harness(
            FakePrimary::accepting(
                false,
                vec![ProviderResponse::Success(PollStatus::Failed {
                    message: "unreadable".to_owned(),
                })],
            ),
            FakeFallback::text("X 1,00"),
        );
        let err = h.orchestrator.run(&image()).await.unwrap_err();
        assert_eq!(err.kind(), ScanErrorKind::OcrFailed);
        assert_eq!(h.fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_errors_surface_their_kind() {
        for (response, kind) in [
            (
                ProviderResponse::RateLimited {
                    message: "slow down".to_owned(),
                },
                ScanErrorKind::RateLimit,
            ),
            (
                ProviderResponse::InvalidKey {
                    message: "bad key".to_owned(),
                },
                ScanErrorKind::InvalidApiKey,
            ),
            (
                ProviderResponse::GenericError {
                    message: "boom".to_owned(),
                },
                ScanErrorKind::ProviderError,
            ),
        ] {
            let h = harness(FakePrimary::new(response, vec![]), FakeFallback::text("X 1,00"));
            let err = h.orchestrator.run(&image()).await.unwrap_err();
            assert_eq!(err.kind(), kind);
            assert_eq!(h.fallback.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_transient_poll_errors_use_up_attempts() {
        let h = harness(
            FakePrimary::accepting(
                false,
                vec![
                    ProviderResponse::GenericError {
                        message: "E500".to_owned(),
                    },
                    ProviderResponse::GenericError {
                        message: "reset".to_owned(),
                    },
                    done(vec![ExtractedLineItem::single("VELA", 15.0)]),
                ],
            ),
            FakeFallback::text(""),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(h.clock.sleeps.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_while_polling_is_not_retried() {
        let h = harness(
            FakePrimary::accepting(
                false,
                vec![
                    ProviderResponse::RateLimited {
                        message: "429".to_owned(),
                    },
                    done(vec![ExtractedLineItem::single("VELA", 15.0)]),
                ],
            ),
            FakeFallback::text("X 1,00"),
        );
        let err = h.orchestrator.run(&image()).await.unwrap_err();
        assert_eq!(err.kind(), ScanErrorKind::RateLimit);
        assert_eq!(h.primary.poll_count.load(Ordering::SeqCst), 1);
        assert_eq!(h.fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_closed_to_fallback() {
        let quota = Arc::new(QuotaTracker::new(
            Arc::new(UnavailableStore),
            QuotaLimits::default(),
            StoreFailurePolicy::FailClosed,
        ));
        let h = harness_with_quota(
            quota,
            FakePrimary::accepting(false, vec![done(vec![])]),
            FakeFallback::text("FILTRO DE AR   32,00"),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(h.primary.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(h.fallback.call_count(), 1);
        assert_eq!(outcome.source, ProviderKind::Fallback);
        assert_eq!(
            outcome.items,
            vec![ExtractedLineItem::single("FILTRO DE AR", 32.0)]
        );
        assert_eq!(
            outcome.fallback.map(|report| report.reason),
            Some(FallbackReason::LocalQuotaDenied)
        );
    }

    #[tokio::test]
    async fn test_fallback_failure_yields_placeholder() {
        let h = harness(
            FakePrimary::new(
                ProviderResponse::QuotaError {
                    message: "quota".to_owned(),
                },
                vec![],
            ),
            FakeFallback::new(ProviderResponse::GenericError {
                message: "E500".to_owned(),
            }),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert!(outcome.manual_entry_required);
        assert_eq!(
            outcome.items,
            vec![ExtractedLineItem::manual_entry_placeholder()]
        );
        let report = outcome.fallback.unwrap();
        assert_eq!(report.error, Some(ScanErrorKind::ProviderError));
    }

    #[tokio::test]
    async fn test_fallback_without_prices_yields_placeholder() {
        let h = harness(
            FakePrimary::new(
                ProviderResponse::QuotaError {
                    message: "quota".to_owned(),
                },
                vec![],
            ),
            FakeFallback::text("NOTA FISCAL\nobrigado pela preferencia"),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert!(outcome.manual_entry_required);
        assert_eq!(outcome.items.len(), 1);
        assert!(outcome.items[0].is_manual_entry_placeholder());
        assert_eq!(outcome.fallback.unwrap().error, None);
    }

    #[tokio::test]
    async fn test_cancelled_scan_keeps_recorded_usage() {
        /// A clock whose sleeps never finish.
        struct StuckClock;

        #[async_trait]
        impl Clock for StuckClock {
            fn now(&self) -> DateTime<Utc> {
                Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
            }
            async fn sleep(&self, _duration: Duration) {
                std::future::pending::<()>().await;
            }
        }

        let quota = Arc::new(memory_tracker());
        let orchestrator = PollingOrchestrator::new(
            quota.clone(),
            Arc::new(FakePrimary::accepting(false, vec![])),
            Arc::new(FakeFallback::text("")),
        )
        .with_clock(Arc::new(StuckClock));
        let result =
            tokio::time::timeout(Duration::from_millis(50), orchestrator.run(&image())).await;
        assert!(result.is_err());
        assert_eq!(quota.current_usage(MONTH).await.unwrap().usage, 1);
    }

    #[tokio::test]
    async fn test_failed_usage_recording_does_not_stop_scan() {
        /// Reads work, increments don't.
        #[derive(Default)]
        struct ReadOnlyStore(MemoryCounterStore);

        #[async_trait]
        impl CounterStore for ReadOnlyStore {
            async fn get(&self, key: &str) -> crate::quota::store::StoreResult<u64> {
                self.0.get(key).await
            }
            async fn incr(&self, _key: &str) -> crate::quota::store::StoreResult<u64> {
                Err(crate::quota::store::StoreError::Unavailable("read only".to_owned()))
            }
            async fn expire(
                &self,
                key: &str,
                ttl: Duration,
            ) -> crate::quota::store::StoreResult<()> {
                self.0.expire(key, ttl).await
            }
            async fn set(&self, key: &str, value: u64) -> crate::quota::store::StoreResult<()> {
                self.0.set(key, value).await
            }
        }

        let quota = Arc::new(QuotaTracker::new(
            Arc::new(ReadOnlyStore::default()),
            QuotaLimits::default(),
            StoreFailurePolicy::FailOpen,
        ));
        let h = harness_with_quota(
            quota,
            FakePrimary::accepting(false, vec![done(vec![])]),
            FakeFallback::text(""),
        );
        let outcome = h.orchestrator.run(&image()).await.unwrap();
        assert_eq!(outcome.usage_count, None);
        assert_eq!(outcome.source, ProviderKind::Primary);
    }

    #[tokio::test]
    async fn test_submit_stops_at_polling() {
        let h = harness(FakePrimary::accepting(false, vec![]), FakeFallback::text(""));
        match h.orchestrator.submit(&image()).await.unwrap() {
            Submission::Queued { job, usage } => {
                assert_eq!(job.token, "job-1");
                assert_eq!(job.status(), JobStatus::Pending);
                assert_eq!(usage.usage_count, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.primary.poll_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_job_maps_failures() {
        let h = harness(
            FakePrimary::accepting(
                false,
                vec![
                    ProviderResponse::Success(PollStatus::Failed {
                        message: "bad".to_owned(),
                    }),
                    ProviderResponse::InvalidKey {
                        message: "key".to_owned(),
                    },
                ],
            ),
            FakeFallback::text(""),
        );
        let err = h.orchestrator.check_job("job-1").await.unwrap_err();
        assert_eq!(err.kind(), ScanErrorKind::OcrFailed);
        let err = h.orchestrator.check_job("job-1").await.unwrap_err();
        assert_eq!(err.kind(), ScanErrorKind::InvalidApiKey);
        assert_eq!(
            h.orchestrator.check_job("job-1").await.unwrap(),
            PollStatus::Pending
        );
    }
}
