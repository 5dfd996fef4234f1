//! Product catalog snapshots.
//!
//! The catalog belongs to whoever embeds the pipeline. We only read it, once
//! per scan, and never write back.

use std::{fmt, sync::Arc};

use schemars::JsonSchema;
use serde::de::{self, Deserializer, Visitor};

use crate::{items::DEFAULT_UNIT, prelude::*};

/// A product we might link an invoice line to.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCandidate {
    /// Product ID. Numeric IDs are accepted and kept as strings.
    #[serde(deserialize_with = "deserialize_id")]
    #[schemars(with = "String")]
    pub id: String,

    /// Display name. This is what we match against.
    pub name: String,

    /// Stock-keeping unit code, if any.
    #[serde(default)]
    pub sku: Option<String>,

    /// Unit of sale.
    #[serde(default = "default_unit")]
    pub unit: String,

    /// What we pay per unit.
    #[serde(default)]
    pub cost: f64,

    /// Units on hand.
    #[serde(default, alias = "current_stock")]
    pub current_stock: f64,
}

fn default_unit() -> String {
    DEFAULT_UNIT.to_owned()
}

/// Accept IDs written as strings or as integers.
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct IdVisitor;

    impl Visitor<'_> for IdVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or integer product ID")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<String, E> {
            Ok(v.to_owned())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

impl ProductCandidate {
    /// Fill in blanks that CSV exports tend to leave empty.
    fn fill_defaults(mut self) -> Self {
        if self.unit.trim().is_empty() {
            self.unit = default_unit();
        }
        if self.sku.as_deref().is_some_and(|sku| sku.trim().is_empty()) {
            self.sku = None;
        }
        self
    }
}

/// Supplies catalog snapshots.
#[async_trait]
pub trait CatalogProvider: Send + Sync + 'static {
    /// Every product, in catalog order. Order matters: it breaks match ties.
    async fn list_products(&self) -> Result<Vec<ProductCandidate>>;
}

/// A fixed, in-memory catalog.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    products: Arc<Vec<ProductCandidate>>,
}

impl StaticCatalog {
    /// Wrap a list of products.
    pub fn new(products: Vec<ProductCandidate>) -> Self {
        Self {
            products: Arc::new(products),
        }
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn list_products(&self) -> Result<Vec<ProductCandidate>> {
        Ok(self.products.as_ref().clone())
    }
}

/// A catalog exported to a JSON array or a CSV file, re-read on every call.
#[derive(Clone, Debug)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    /// Read products from `path`. The format is chosen by extension: `.csv`
    /// for CSV, anything else for JSON.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Parse a catalog from its text.
pub fn parse_catalog(text: &str, is_csv: bool) -> Result<Vec<ProductCandidate>> {
    let products = if is_csv {
        csv::Reader::from_reader(text.as_bytes())
            .deserialize::<ProductCandidate>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to parse CSV catalog")?
    } else {
        serde_json::from_str::<Vec<ProductCandidate>>(text)
            .context("failed to parse JSON catalog")?
    };
    Ok(products.into_iter().map(ProductCandidate::fill_defaults).collect())
}

#[async_trait]
impl CatalogProvider for FileCatalog {
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    async fn list_products(&self) -> Result<Vec<ProductCandidate>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read catalog {}", self.path.display()))?;
        let is_csv = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let products = parse_catalog(&text, is_csv)
            .with_context(|| format!("in catalog {}", self.path.display()))?;
        debug!(count = products.len(), "Loaded catalog");
        Ok(products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_catalog_with_numeric_ids() {
        let products = parse_catalog(
            r#"[
                {"id": 17, "name": "FILTRO OLEO MOTOR", "unit": "pc", "cost": 32.5, "currentStock": 4},
                {"id": "abc", "name": "VELA IGNICAO"}
            ]"#,
            false,
        )
        .unwrap();
        assert_eq!(products[0].id, "17");
        assert_eq!(products[0].unit, "pc");
        assert_eq!(products[0].current_stock, 4.0);
        assert_eq!(products[1].id, "abc");
        assert_eq!(products[1].unit, "un");
        assert_eq!(products[1].cost, 0.0);
        assert_eq!(products[1].sku, None);
    }

    #[test]
    fn test_csv_catalog() {
        let products = parse_catalog(
            "id,name,sku,unit,cost,currentStock\n1,OLEO 5W30 SINTETICO,OL-5W30,l,45.9,12\n2,PASTILHA FREIO,,,80,0\n",
            true,
        )
        .unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].sku.as_deref(), Some("OL-5W30"));
        assert_eq!(products[0].cost, 45.9);
        assert_eq!(products[1].id, "2");
        assert_eq!(products[1].sku, None);
        assert_eq!(products[1].unit, "un");
    }

    #[test]
    fn test_bad_catalog_is_an_error() {
        assert!(parse_catalog("{}", false).is_err());
        assert!(parse_catalog("id,name\n", true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_catalog_reads_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        std::fs::write(&path, "id,name\n9,CORREIA DENTADA\n").unwrap();
        let products = FileCatalog::new(&path).list_products().await.unwrap();
        assert_eq!(products[0].name, "CORREIA DENTADA");

        let missing = FileCatalog::new(dir.path().join("missing.json"));
        assert!(missing.list_products().await.is_err());
    }
}
