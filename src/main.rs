use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod catalog;
mod cmd;
mod config;
mod error;
mod image;
mod items;
mod normalize;
mod orchestrator;
mod prelude;
mod providers;
mod quota;
mod rate_limit;
mod reconcile;
mod service;
mod ui;

/// Scan invoices and license plates, and match invoice items to a product
/// catalog.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - TABSCANNER_API_KEY: Key for the primary invoice OCR provider.
  - TABSCANNER_API_BASE (optional): Override the primary provider URL.
  - OCR_SPACE_API_KEY (optional): Key for the fallback text OCR provider.
    Defaults to the public demo key.
  - OCR_SPACE_API_BASE (optional): Override the fallback provider URL.
  - SCAN_QUOTA_LIMIT, SCAN_QUOTA_WARNING (optional): Monthly quota and
    warning threshold for the primary provider. Default 200 and 180.
  - SCAN_COUNTER_STORE (optional): "memory", "file:PATH" or a Redis URL.
  - SCAN_STORE_FAILURE_POLICY (optional): "fail-open" or "fail-closed".
  - SCAN_CATALOG (optional): Product catalog, as JSON or CSV.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Scan images from start to finish, writing one JSONL record per image.
    Scan(cmd::scan::ScanOpts),
    /// Start a scan and print a job token, or the result if it's already done.
    Submit(cmd::submit::SubmitOpts),
    /// Check on a submitted invoice scan.
    Poll(cmd::poll::PollOpts),
    /// Show or set this month's primary provider usage.
    Usage(cmd::usage::UsageOpts),
    /// Find and normalize a license plate in OCR text.
    NormalizePlate(cmd::normalize::NormalizePlateOpts),
    /// Match extracted items against a product catalog.
    Reconcile(cmd::reconcile::ReconcileOpts),
    /// Print schemas for output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Scan(opts) => opts.output_path.is_none(),
            Cmd::Submit(opts) => opts.output_path.is_none(),
            Cmd::Poll(opts) => opts.output_path.is_none(),
            Cmd::Usage(opts) => opts.output_path.is_none(),
            Cmd::NormalizePlate(opts) => opts.output_path.is_none(),
            Cmd::Reconcile(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Scan(opts) => cmd::scan::cmd_scan(ui, opts).await?,
        Cmd::Submit(opts) => cmd::submit::cmd_submit(opts).await?,
        Cmd::Poll(opts) => cmd::poll::cmd_poll(opts).await?,
        Cmd::Usage(opts) => cmd::usage::cmd_usage(&ui, opts).await?,
        Cmd::NormalizePlate(opts) => cmd::normalize::cmd_normalize_plate(opts).await?,
        Cmd::Reconcile(opts) => cmd::reconcile::cmd_reconcile(opts).await?,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await?,
    }
    Ok(())
}
