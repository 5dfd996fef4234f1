//! The `scan` subcommand: scan a batch of images from start to finish.

use std::sync::{Arc, Mutex};

use clap::Args;
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::{BoxedStream, io::write_jsonl},
    config::{ProviderOpts, QuotaOpts, build_service},
    error::ScanErrorKind,
    image::ScanImage,
    prelude::*,
    service::{InvoiceScan, PlateScan, ScanKind, ScanService},
    ui::{ProgressConfig, Ui},
};

use super::CatalogOpts;

/// Scan command line arguments.
#[derive(Debug, Args)]
pub struct ScanOpts {
    /// Image files to scan.
    #[clap(required = true, value_name = "IMAGE")]
    pub images: Vec<PathBuf>,

    /// What the images contain.
    #[clap(long, value_enum, default_value = "invoice")]
    pub kind: ScanKind,

    /// Max number of scans to run at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// What portion of images should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,

    #[clap(flatten)]
    pub provider: ProviderOpts,

    #[clap(flatten)]
    pub quota: QuotaOpts,

    #[clap(flatten)]
    pub catalog: CatalogOpts,

    /// Write JSONL results here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Did a scan succeed?
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Ok,
    Failed,
}

/// One line of `scan` output.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub path: PathBuf,
    pub status: ScanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ScanErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<InvoiceScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate: Option<PlateScan>,
}

impl ScanRecord {
    fn ok(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            status: ScanStatus::Ok,
            error_kind: None,
            errors: vec![],
            invoice: None,
            plate: None,
        }
    }

    fn failed(path: &Path, error_kind: Option<ScanErrorKind>, error: String) -> Self {
        Self {
            status: ScanStatus::Failed,
            error_kind,
            errors: vec![error],
            ..Self::ok(path)
        }
    }
}

/// Scan one image, turning every failure into a failed record.
async fn scan_one(service: &ScanService, path: &Path, kind: ScanKind) -> ScanRecord {
    let image = match ScanImage::from_path(path).await {
        Ok(image) => image,
        Err(err) => return ScanRecord::failed(path, None, format!("{err:#}")),
    };
    let result = match kind {
        ScanKind::Invoice => service.scan_invoice(&image).await.map(|invoice| ScanRecord {
            invoice: Some(invoice),
            ..ScanRecord::ok(path)
        }),
        ScanKind::Plate => service
            .scan_plate(&image)
            .await
            .and_then(PlateScan::into_found)
            .map(|plate| ScanRecord {
                plate: Some(plate),
                ..ScanRecord::ok(path)
            }),
    };
    result.unwrap_or_else(|err| {
        warn!(
            path = %path.display(),
            %err,
            recoverable = err.kind().is_recoverable(),
            "Scan failed"
        );
        ScanRecord::failed(path, Some(err.kind()), err.to_string())
    })
}

/// Counters for a batch of scans.
#[derive(Clone, Debug, Default)]
pub struct ScanCounters {
    /// How many images did we process?
    pub total_record_count: usize,

    /// How many images failed?
    pub failure_count: usize,

    /// How many invoices went to the fallback provider?
    pub fallback_count: usize,

    /// How many invoices need their items typed in by hand?
    pub manual_entry_count: usize,

    /// Did we see the quota warning?
    pub saw_quota_warning: bool,
}

impl ScanCounters {
    /// Wrap a stream with counters.
    pub fn wrap_stream(
        stream: BoxedStream<Result<ScanRecord>>,
    ) -> (BoxedStream<Result<ScanRecord>>, Arc<Mutex<ScanCounters>>) {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |record| {
                let record = record?;
                counters_clone.lock().expect("lock poisoned").update(&record);
                Ok(record)
            })
            .boxed();
        (stream, counters)
    }

    fn update(&mut self, record: &ScanRecord) {
        self.total_record_count += 1;
        if record.status != ScanStatus::Ok {
            self.failure_count += 1;
        }
        if let Some(invoice) = &record.invoice {
            if invoice.fallback.is_some() {
                self.fallback_count += 1;
            }
            if invoice.manual_entry_required {
                self.manual_entry_count += 1;
            }
            self.saw_quota_warning |= invoice.warning;
        }
    }

    /// Report counters to the user, and fail if too many scans failed.
    pub fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        if self.saw_quota_warning {
            ui.display_message("⚠️", "Primary OCR quota is nearly used up this month");
        }
        if self.fallback_count > 0 {
            ui.display_message(
                "↪️",
                &format!("{} invoices used the fallback provider", self.fallback_count),
            );
        }
        if self.manual_entry_count > 0 {
            ui.display_message(
                "✍️",
                &format!(
                    "{} invoices need their items entered by hand",
                    self.manual_entry_count
                ),
            );
        }
        let failure_rate = if self.total_record_count == 0 {
            0.0
        } else {
            self.failure_count as f32 / self.total_record_count as f32
        };
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of scans were failures, but only {:.2}% were allowed",
                self.failure_count,
                self.total_record_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            if self.failure_count > 0 {
                ui.display_message(
                    "❌",
                    &format!("{} images could not be scanned", self.failure_count),
                );
            }
            Ok(())
        }
    }
}

/// The `scan` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_scan(ui: Ui, opts: &ScanOpts) -> Result<()> {
    let service =
        Arc::new(build_service(&opts.provider, &opts.quota, opts.catalog.provider()).await?);

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🧾",
            msg: "Scanning images",
            done_msg: "Scanned images",
        },
        opts.images.len() as u64,
    );

    let kind = opts.kind;
    let stream_service = service.clone();
    let futures = stream::iter(opts.images.clone()).map(move |path| {
        let service = stream_service.clone();
        async move { Ok::<_, anyhow::Error>(scan_one(&service, &path, kind).await) }
    });
    let output = pb.wrap_stream(futures.buffered(opts.job_count.max(1))).boxed();

    let (output, counters) = ScanCounters::wrap_stream(output);
    write_jsonl(opts.output_path.as_deref(), output).await?;
    let counters = counters.lock().expect("lock poisoned").clone();

    if kind == ScanKind::Invoice {
        match service.quota_status().await {
            Ok(status) => ui.display_message(
                "📊",
                &format!(
                    "Primary OCR usage for {}: {}/{}",
                    status.month_key, status.usage, status.limit
                ),
            ),
            Err(err) => warn!(%err, "Could not read quota usage"),
        }
    }
    counters.finish(&ui, opts.allowed_failure_rate)
}

#[cfg(test)]
mod tests {
    use crate::providers::ProviderKind;

    use super::*;

    fn invoice(warning: bool, manual_entry_required: bool) -> InvoiceScan {
        InvoiceScan {
            items: vec![],
            source: ProviderKind::Primary,
            cached: false,
            warning,
            usage_count: Some(1),
            fallback: None,
            manual_entry_required,
        }
    }

    #[test]
    fn test_counters_enforce_failure_rate() {
        let mut counters = ScanCounters::default();
        counters.update(&ScanRecord {
            invoice: Some(invoice(true, false)),
            ..ScanRecord::ok(Path::new("a.jpg"))
        });
        counters.update(&ScanRecord::failed(
            Path::new("b.jpg"),
            Some(ScanErrorKind::Timeout),
            "polling gave up".to_owned(),
        ));
        assert_eq!(counters.total_record_count, 2);
        assert_eq!(counters.failure_count, 1);
        assert!(counters.saw_quota_warning);

        let ui = Ui::init_for_tests();
        assert!(counters.finish(&ui, 0.5).is_ok());
        assert!(counters.finish(&ui, 0.1).is_err());
    }

    #[test]
    fn test_empty_batch_passes() {
        let ui = Ui::init_for_tests();
        assert!(ScanCounters::default().finish(&ui, 0.0).is_ok());
    }

    #[test]
    fn test_failed_record_json() {
        let record = ScanRecord::failed(
            Path::new("b.jpg"),
            Some(ScanErrorKind::OcrFailed),
            "rejected".to_owned(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "path": "b.jpg",
                "status": "failed",
                "errorKind": "OCR_FAILED",
                "errors": ["rejected"],
            })
        );
    }
}
