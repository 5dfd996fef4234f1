//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json,
    catalog::ProductCandidate,
    items::ExtractedLineItem,
    prelude::*,
    quota::QuotaStatus,
    reconcile::ReconciledItem,
    service::{InvoiceScan, PlateScan, PollResponse, SubmitResponse},
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// An invoice line item as read by a provider.
    ExtractedLineItem,
    /// A line item after catalog matching.
    ReconciledItem,
    /// A finished invoice scan.
    InvoiceScan,
    /// A plate scan.
    PlateScan,
    /// Monthly quota usage.
    QuotaStatus,
    /// A catalog product.
    ProductCandidate,
    /// The `submit` response.
    SubmitResponse,
    /// The `poll` response.
    PollResponse,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::ExtractedLineItem => schema_for!(ExtractedLineItem),
        SchemaType::ReconciledItem => schema_for!(ReconciledItem),
        SchemaType::InvoiceScan => schema_for!(InvoiceScan),
        SchemaType::PlateScan => schema_for!(PlateScan),
        SchemaType::QuotaStatus => schema_for!(QuotaStatus),
        SchemaType::ProductCandidate => schema_for!(ProductCandidate),
        SchemaType::SubmitResponse => schema_for!(SubmitResponse),
        SchemaType::PollResponse => schema_for!(PollResponse),
    };
    write_json(schema_opts.output_path.as_deref(), &schema).await
}
