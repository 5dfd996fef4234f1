//! Extracted invoice line items, and the parser for unstructured fallback
//! text.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;

use crate::{normalize::invoice::parse_decimal, prelude::*};

/// The unit we assume when a provider doesn't give one.
pub const DEFAULT_UNIT: &str = "un";

/// Description of the placeholder item returned when we couldn't read
/// anything.
pub const MANUAL_ENTRY_DESCRIPTION: &str =
    "OCR failed on the fallback provider. Enter the items manually.";

/// A price at the very end of a line. The first alternative keeps pt-BR
/// thousands groups (`1.234,56`) together.
static TRAILING_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}(?:\.\d{3})+,\d{2}|\d+[.,]\d{2})$")
        .expect("failed to compile regex")
});

/// One line of an invoice, as read by a provider.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedLineItem {
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    pub unit_price: f64,
}

impl ExtractedLineItem {
    /// A single unit of something, at `unit_price`.
    pub fn single(description: impl Into<String>, unit_price: f64) -> Self {
        Self {
            description: description.into(),
            quantity: 1.0,
            unit: DEFAULT_UNIT.to_owned(),
            unit_price,
        }
    }

    /// The synthetic item that tells the operator to type items in by hand.
    pub fn manual_entry_placeholder() -> Self {
        Self::single(MANUAL_ENTRY_DESCRIPTION, 0.0)
    }

    /// Is this the manual entry placeholder?
    pub fn is_manual_entry_placeholder(&self) -> bool {
        self.description == MANUAL_ENTRY_DESCRIPTION
    }
}

/// Parse raw OCR text into line items, one per line that ends in a price.
///
/// Everything before the price is the description. Quantity is always 1,
/// since plain text gives us no reliable way to find it. Lines without a
/// trailing price are dropped.
pub fn parse_fallback_text(raw_text: &str) -> Vec<ExtractedLineItem> {
    raw_text
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let price = TRAILING_PRICE_RE.find(line)?;
            let unit_price = parse_decimal(price.as_str())?;
            let description = line[..price.start()].trim();
            Some(ExtractedLineItem::single(description, unit_price))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_splits_off_description() {
        let items = parse_fallback_text("OLEO 5W30 SINTET   45,00");
        assert_eq!(
            items,
            vec![ExtractedLineItem {
                description: "OLEO 5W30 SINTET".to_owned(),
                quantity: 1.0,
                unit: "un".to_owned(),
                unit_price: 45.0,
            }]
        );
    }

    #[test]
    fn test_lines_without_prices_are_dropped() {
        let text = "AUTO PECAS LTDA\r\nFILTRO AR 32.90\r\nObrigado!\r\nPASTILHA FREIO 1.234,56\r\n";
        let items = parse_fallback_text(text);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].description, "FILTRO AR");
        assert_eq!(items[0].unit_price, 32.90);
        assert_eq!(items[1].description, "PASTILHA FREIO");
        assert_eq!(items[1].unit_price, 1234.56);
    }

    #[test]
    fn test_price_must_be_at_end() {
        assert!(parse_fallback_text("10,00 desconto aplicado").is_empty());
        assert!(parse_fallback_text("").is_empty());
    }

    #[test]
    fn test_placeholder_is_recognizable() {
        let item = ExtractedLineItem::manual_entry_placeholder();
        assert!(item.is_manual_entry_placeholder());
        assert_eq!(item.quantity, 1.0);
        assert_eq!(item.unit_price, 0.0);
        assert!(!ExtractedLineItem::single("FILTRO", 1.0).is_manual_entry_placeholder());
    }
}
