//! The `poll` subcommand.

use clap::Args;

use crate::{
    async_utils::io::write_json,
    config::{ProviderOpts, QuotaOpts, build_service},
    prelude::*,
};

use super::CatalogOpts;

/// Poll command line arguments.
#[derive(Debug, Args)]
pub struct PollOpts {
    /// The job token returned by `submit`.
    #[clap(value_name = "TOKEN")]
    pub job_token: String,

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

/// The `poll` subcommand. Checks the job once, without waiting.
#[instrument(level = "debug", skip_all, fields(job_token = %opts.job_token))]
pub async fn cmd_poll(opts: &PollOpts) -> Result<()> {
    let service = build_service(&opts.provider, &opts.quota, opts.catalog.provider()).await?;
    let response = service.poll_scan(&opts.job_token).await?;
    write_json(opts.output_path.as_deref(), &response).await
}
