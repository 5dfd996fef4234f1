//! Command-line entry points.

use std::sync::Arc;

use clap::Args;

use crate::{
    catalog::{CatalogProvider, FileCatalog, StaticCatalog},
    prelude::*,
};

pub mod normalize;
pub mod poll;
pub mod reconcile;
pub mod scan;
pub mod schema;
pub mod submit;
pub mod usage;

/// Where to find the product catalog.
#[derive(Debug, Clone, Args)]
pub struct CatalogOpts {
    /// A product catalog, as a JSON array or a CSV file. Without one, no
    /// items are linked to products.
    #[clap(long, env = "SCAN_CATALOG")]
    pub catalog: Option<PathBuf>,
}

impl CatalogOpts {
    /// Get a catalog provider.
    pub fn provider(&self) -> Arc<dyn CatalogProvider> {
        match &self.catalog {
            Some(path) => Arc::new(FileCatalog::new(path)),
            None => {
                debug!("No catalog configured, using an empty one");
                Arc::new(StaticCatalog::new(vec![]))
            }
        }
    }
}
