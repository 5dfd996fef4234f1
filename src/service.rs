//! The pipeline's external operations: submit a scan, poll it, report quota,
//! or run a whole scan in one call.
//!
//! This is where extraction meets the catalog. Items coming out of either
//! provider are normalized and then reconciled against a fresh catalog
//! snapshot.

use std::sync::Arc;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{
    catalog::{CatalogProvider, ProductCandidate},
    error::{ScanError, ScanErrorKind},
    image::ScanImage,
    items::ExtractedLineItem,
    normalize::{
        invoice::normalize_line_items,
        plate::{PlateFormat, PlateText, extract_plate},
    },
    orchestrator::{ExtractionOutcome, FallbackReport, PollingOrchestrator, Submission},
    prelude::*,
    providers::{ProviderKind, ProviderResponse, fallback::TextMode, primary::PollStatus},
    quota::QuotaStatus,
    reconcile::{ReconciledItem, ReconciliationEngine},
};

/// What kind of image is being scanned.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[clap(rename_all = "lowercase")]
pub enum ScanKind {
    Invoice,
    Plate,
}

/// A finished invoice scan.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceScan {
    pub items: Vec<ReconciledItem>,
    pub source: ProviderKind,
    pub cached: bool,
    pub warning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackReport>,
    pub manual_entry_required: bool,
}

/// A plate scan. `plate_text` is `NOT_FOUND` if nothing valid was read.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateScan {
    pub plate_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<PlateFormat>,
}

impl PlateScan {
    /// Report a normalized plate.
    pub fn from_plate_text(plate: PlateText) -> Self {
        match plate {
            PlateText::Valid { text, format } => Self {
                plate_text: text,
                format: Some(format),
            },
            PlateText::NotFound => Self {
                plate_text: PlateText::NotFound.as_str().to_owned(),
                format: None,
            },
        }
    }

    /// Did we read a valid plate?
    pub fn is_found(&self) -> bool {
        self.format.is_some()
    }

    /// Treat the `NOT_FOUND` sentinel as an error.
    pub fn into_found(self) -> std::result::Result<Self, ScanError> {
        if self.is_found() {
            Ok(self)
        } else {
            Err(ScanError::new(
                ScanErrorKind::PlateNotFound,
                "no valid plate in recognized text",
            ))
        }
    }
}

/// An invoice upload waiting to be polled.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedScan {
    pub job_token: String,
    pub cached: bool,
    pub warning: bool,
}

/// The answer to `submit_scan`.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    /// Poll `jobToken` for the result.
    Queued(QueuedScan),
    /// The scan went to the fallback provider and is already done.
    Completed(InvoiceScan),
    /// Plates are recognized synchronously.
    Plate(PlateScan),
}

/// Job status as reported to pollers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollState {
    Pending,
    Done,
    Failed,
}

/// The answer to `poll_scan`.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub status: PollState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<InvoiceScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScanErrorKind>,
}

/// The scan pipeline, ready to serve requests.
pub struct ScanService {
    orchestrator: Arc<PollingOrchestrator>,
    catalog: Arc<dyn CatalogProvider>,
    engine: ReconciliationEngine,
}

impl ScanService {
    /// Create a new service.
    pub fn new(
        orchestrator: Arc<PollingOrchestrator>,
        catalog: Arc<dyn CatalogProvider>,
        engine: ReconciliationEngine,
    ) -> Self {
        Self {
            orchestrator,
            catalog,
            engine,
        }
    }

    async fn load_catalog(&self) -> std::result::Result<Vec<ProductCandidate>, ScanError> {
        self.catalog.list_products().await.map_err(|err| {
            error!("Could not load catalog: {err:#}");
            ScanError::new(ScanErrorKind::CatalogUnavailable, format!("{err:#}"))
        })
    }

    fn finish_invoice(&self, outcome: ExtractionOutcome, catalog: &[ProductCandidate]) -> InvoiceScan {
        let mut items = normalize_line_items(outcome.items);
        let mut manual_entry_required = outcome.manual_entry_required;
        if items.is_empty() && outcome.source == ProviderKind::Fallback {
            // Everything the fallback read was receipt furniture.
            items.push(ExtractedLineItem::manual_entry_placeholder());
            manual_entry_required = true;
        }
        InvoiceScan {
            items: self.engine.reconcile(items, catalog),
            source: outcome.source,
            cached: outcome.cached,
            warning: outcome.warning,
            usage_count: outcome.usage_count,
            fallback: outcome.fallback,
            manual_entry_required,
        }
    }

    /// Start a scan.
    ///
    /// Invoices are uploaded and returned as a job token, unless the quota
    /// sends them to the fallback provider, in which case the finished result
    /// comes back right away. Plates are always recognized synchronously.
    #[instrument(level = "debug", skip(self, image))]
    pub async fn submit_scan(
        &self,
        image: &ScanImage,
        kind: ScanKind,
    ) -> std::result::Result<SubmitResponse, ScanError> {
        match kind {
            ScanKind::Plate => Ok(SubmitResponse::Plate(self.scan_plate(image).await?)),
            ScanKind::Invoice => match self.orchestrator.submit(image).await? {
                Submission::Queued { job, usage } => Ok(SubmitResponse::Queued(QueuedScan {
                    job_token: job.token,
                    cached: usage.cached,
                    warning: usage.warning,
                })),
                Submission::Completed(outcome) => {
                    let catalog = self.load_catalog().await?;
                    Ok(SubmitResponse::Completed(
                        self.finish_invoice(outcome, &catalog),
                    ))
                }
            },
        }
    }

    /// Check on a submitted invoice. Finished results are reconciled against
    /// the current catalog.
    #[instrument(level = "debug", skip(self))]
    pub async fn poll_scan(&self, job_token: &str) -> std::result::Result<PollResponse, ScanError> {
        match self.orchestrator.check_job(job_token).await {
            Ok(PollStatus::Pending | PollStatus::Processing) => Ok(PollResponse {
                status: PollState::Pending,
                result: None,
                error: None,
            }),
            Ok(PollStatus::Done(items)) => {
                let catalog = self.load_catalog().await?;
                let outcome = ExtractionOutcome {
                    items,
                    source: ProviderKind::Primary,
                    cached: false,
                    warning: false,
                    usage_count: None,
                    fallback: None,
                    manual_entry_required: false,
                };
                Ok(PollResponse {
                    status: PollState::Done,
                    result: Some(self.finish_invoice(outcome, &catalog)),
                    error: None,
                })
            }
            // Only an explicit rejection is a FAILED job; everything else is
            // a failure to find out.
            Err(err) if err.kind() == ScanErrorKind::OcrFailed => Ok(PollResponse {
                status: PollState::Failed,
                result: None,
                error: Some(err.kind()),
            }),
            Ok(PollStatus::Failed { .. }) => Ok(PollResponse {
                status: PollState::Failed,
                result: None,
                error: Some(ScanErrorKind::OcrFailed),
            }),
            Err(err) => Err(err),
        }
    }

    /// This month's primary-provider usage.
    pub async fn quota_status(&self) -> std::result::Result<QuotaStatus, ScanError> {
        let month_key = self.orchestrator.current_month_key();
        self.orchestrator
            .quota()
            .current_usage(&month_key)
            .await
            .map_err(|err| ScanError::new(ScanErrorKind::StoreUnavailable, err.to_string()))
    }

    /// Scan an invoice from start to finish.
    ///
    /// The catalog is loaded first, so that an unavailable catalog doesn't
    /// spend quota.
    #[instrument(level = "debug", skip_all, fields(image = ?image))]
    pub async fn scan_invoice(&self, image: &ScanImage) -> std::result::Result<InvoiceScan, ScanError> {
        let catalog = self.load_catalog().await?;
        let outcome = self.orchestrator.run(image).await?;
        Ok(self.finish_invoice(outcome, &catalog))
    }

    /// Read a license plate.
    #[instrument(level = "debug", skip_all, fields(image = ?image))]
    pub async fn scan_plate(&self, image: &ScanImage) -> std::result::Result<PlateScan, ScanError> {
        let response = self
            .orchestrator
            .fallback_client()
            .recognize_text(image, TextMode::Plate)
            .await;
        match response {
            ProviderResponse::Success(text) => {
                let plate = extract_plate(&text);
                if plate.is_found() {
                    info!(plate = %plate, "Read plate");
                } else {
                    warn!(text = %text.replace('\n', " "), "No plate in recognized text");
                }
                Ok(PlateScan::from_plate_text(plate))
            }
            other => {
                let err = ScanError::new(
                    other.error_kind().unwrap_or(ScanErrorKind::ProviderError),
                    other.error_message().unwrap_or_default(),
                );
                error!(%err, "Plate recognition failed");
                Err(err)
            }
        }
    }
}
