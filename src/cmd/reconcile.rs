//! The `reconcile` subcommand: match already-extracted items against a
//! catalog, without calling any provider.

use clap::Args;

use crate::{
    async_utils::io::{read_to_string, write_json},
    items::{ExtractedLineItem, parse_fallback_text},
    normalize::invoice::normalize_line_items,
    prelude::*,
    reconcile::{MatchThresholds, MatchTier, ReconciliationEngine},
};

use super::CatalogOpts;

/// Reconcile command line arguments.
#[derive(Debug, Args)]
pub struct ReconcileOpts {
    /// Items as a JSON array, or raw OCR text with `--text`. Reads standard
    /// input if omitted.
    pub input_path: Option<PathBuf>,

    /// Treat the input as raw OCR text, one item per line ending in a price.
    #[clap(long)]
    pub text: bool,

    #[clap(flatten)]
    pub catalog: CatalogOpts,

    /// Minimum score to link an item to a product.
    #[clap(long, default_value = "0.75")]
    pub auto_link_threshold: f64,

    /// Minimum score to suggest a product.
    #[clap(long, default_value = "0.60")]
    pub suggest_threshold: f64,

    /// Write the result here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `reconcile` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_reconcile(opts: &ReconcileOpts) -> Result<()> {
    if opts.suggest_threshold > opts.auto_link_threshold {
        return Err(anyhow!(
            "--suggest-threshold {} is above --auto-link-threshold {}",
            opts.suggest_threshold,
            opts.auto_link_threshold
        ));
    }

    let input = read_to_string(opts.input_path.as_deref()).await?;
    let items = if opts.text {
        parse_fallback_text(&input)
    } else {
        serde_json::from_str::<Vec<ExtractedLineItem>>(&input)
            .context("failed to parse items JSON")?
    };
    let catalog = opts.catalog.provider().list_products().await?;
    debug!(items = items.len(), products = catalog.len(), "Reconciling");

    let engine = ReconciliationEngine::new(MatchThresholds {
        auto_link: opts.auto_link_threshold,
        suggest: opts.suggest_threshold,
    });
    let reconciled = engine.reconcile(normalize_line_items(items), &catalog);
    let count_tier = |tier| reconciled.iter().filter(|item| item.tier() == tier).count();
    info!(
        linked = count_tier(MatchTier::AutoLink),
        suggested = count_tier(MatchTier::Suggest),
        unmatched = count_tier(MatchTier::NoMatch),
        "Reconciled items"
    );
    write_json(opts.output_path.as_deref(), &reconciled).await
}
