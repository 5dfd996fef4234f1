//! The `usage` subcommand: show or correct this month's primary provider
//! usage.

use chrono::{NaiveDate, Utc};
use clap::Args;

use crate::{
    async_utils::io::write_json,
    config::QuotaOpts,
    prelude::*,
    quota::month_key,
    ui::Ui,
};

/// Usage command line arguments.
#[derive(Debug, Args)]
pub struct UsageOpts {
    #[clap(flatten)]
    pub quota: QuotaOpts,

    /// Overwrite the counter, for example after checking the provider's
    /// dashboard.
    #[clap(long, value_name = "COUNT")]
    pub set: Option<u64>,

    /// The month to look at, as "YYYY-MM". Defaults to the current UTC month.
    #[clap(long, value_parser = parse_month)]
    pub month: Option<String>,

    /// Write the status here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Accept only a canonical "YYYY-MM" month, the same shape as the counter
/// keys.
fn parse_month(text: &str) -> Result<String> {
    let canonical = NaiveDate::parse_from_str(&format!("{text}-01"), "%Y-%m-%d")
        .ok()
        .map(|date| date.format("%Y-%m").to_string());
    match canonical {
        Some(month) if month == text => Ok(month),
        _ => Err(anyhow!("expected a month like 2026-10, got {text:?}")),
    }
}

/// The `usage` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_usage(ui: &Ui, opts: &UsageOpts) -> Result<()> {
    let tracker = opts.quota.build_tracker().await?;
    let month_key = opts.month.clone().unwrap_or_else(|| month_key(Utc::now()));
    if let Some(count) = opts.set {
        tracker
            .set_usage(&month_key, count)
            .await
            .with_context(|| format!("could not set usage for {month_key}"))?;
        ui.display_message("✏️", &format!("Set usage for {month_key} to {count}"));
    }
    let status = tracker
        .current_usage(&month_key)
        .await
        .with_context(|| format!("could not read usage for {month_key}"))?;
    write_json(opts.output_path.as_deref(), &status).await
}
