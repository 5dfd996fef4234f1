//! The `submit` subcommand: start one scan without waiting for the primary
//! provider.

use clap::Args;

use crate::{
    async_utils::io::{read_to_string, write_json},
    config::{ProviderOpts, QuotaOpts, build_service},
    image::ScanImage,
    prelude::*,
    service::ScanKind,
};

use super::CatalogOpts;

/// Submit command line arguments.
#[derive(Debug, Args)]
pub struct SubmitOpts {
    /// The image to scan.
    pub image: PathBuf,

    /// The file holds base64 text or a `data:` URL rather than raw image
    /// bytes. Use `-` to read it from standard input.
    #[clap(long)]
    pub base64: bool,

    /// What the image contains.
    #[clap(long, value_enum, default_value = "invoice")]
    pub kind: ScanKind,

    #[clap(flatten)]
    pub provider: ProviderOpts,

    #[clap(flatten)]
    pub quota: QuotaOpts,

    #[clap(flatten)]
    pub catalog: CatalogOpts,

    /// Write the response here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `submit` subcommand.
#[instrument(level = "debug", skip_all, fields(image = %opts.image.display()))]
pub async fn cmd_submit(opts: &SubmitOpts) -> Result<()> {
    let service = build_service(&opts.provider, &opts.quota, opts.catalog.provider()).await?;
    let image = if opts.base64 {
        let path = (opts.image != Path::new("-")).then_some(opts.image.as_path());
        ScanImage::from_base64(&read_to_string(path).await?)?
    } else {
        ScanImage::from_path(&opts.image).await?
    };
    let response = service.submit_scan(&image, opts.kind).await?;
    write_json(opts.output_path.as_deref(), &response).await
}
