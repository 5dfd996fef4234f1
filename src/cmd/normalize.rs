//! The `normalize-plate` subcommand.

use clap::Args;

use crate::{
    async_utils::io::write_json, normalize::plate::extract_plate, prelude::*,
    service::PlateScan,
};

/// Plate normalization command line arguments.
#[derive(Debug, Args)]
pub struct NormalizePlateOpts {
    /// Raw OCR text to search for a plate.
    pub text: String,

    /// Write the result here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `normalize-plate` subcommand. Prints `NOT_FOUND` rather than failing
/// when there's no plate.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_normalize_plate(opts: &NormalizePlateOpts) -> Result<()> {
    let scan = PlateScan::from_plate_text(extract_plate(&opts.text));
    write_json(opts.output_path.as_deref(), &scan).await
}
