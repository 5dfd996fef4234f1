//! Cleanup for invoice line items.
//!
//! Receipt printers compress product names to fit narrow paper ("FILT OLEO
//! SINT"), and OCR leaks header and tax lines through even when the provider
//! is told to skip them. We expand the usual abbreviations from a fixed table
//! and drop lines that are obviously not products.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    items::{DEFAULT_UNIT, ExtractedLineItem},
    prelude::*,
};

/// Compressed tokens seen on auto-parts receipts, and their full spelling.
///
/// Keys are matched against the uppercased token with any trailing `.`
/// removed.
static ABBREVIATIONS: &[(&str, &str)] = &[
    ("ADIT", "ADITIVO"),
    ("AMORT", "AMORTECEDOR"),
    ("C/", "COM"),
    ("COMB", "COMBUSTÍVEL"),
    ("CORR", "CORREIA"),
    ("DIANT", "DIANTEIRO"),
    ("DIR", "DIREITO"),
    ("ESQ", "ESQUERDO"),
    ("FILT", "FILTRO"),
    ("FLT", "FILTRO"),
    ("JG", "JOGO"),
    ("LUBR", "LUBRIFICANTE"),
    ("PAST", "PASTILHA"),
    ("PSTL", "PASTILHA"),
    ("ROL", "ROLAMENTO"),
    ("S/", "SEM"),
    ("SEMISINT", "SEMISSINTÉTICO"),
    ("SINT", "SINTÉTICO"),
    ("SINTET", "SINTÉTICO"),
    ("TRAS", "TRASEIRO"),
];

/// Totals and payment lines. These words also start real product names
/// (`TOTAL QUARTZ`, `PIX BORRACHA`), so the whole line must be the keyword
/// plus at most an amount.
static TOTALS_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(sub\s*-?\s*total|total(\s+(a\s+pagar|geral|da\s+nota|do\s+cupom))?|valor\s+(total|pago|a\s+pagar)|troco|desconto|acr[eé]scimo|dinheiro|cart[aã]o(\s+de\s+(cr[eé]dito|d[eé]bito))?|pix)\s*[:=-]?\s*(r\$)?\s*-?[\d.,]*\s*$",
    )
    .expect("failed to compile regex")
});

/// Tax, header and payment-section lines, matched by prefix.
static HEADER_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(base\s+de\s+c[aá]lculo|issqn|icms|ipi|pis|cofins|tributos|cnpj|cpf|inscri[cç][aã]o|forma\s+de\s+pagamento|nota\s+fiscal|nf-?e|cupom)\b",
    )
    .expect("failed to compile regex")
});

/// Parse a decimal number written either way: `45,00`, `45.00`, `1.234,56`
/// or `1,234.56`.
///
/// When both separators appear, the last one is the decimal point. A lone
/// comma is always a decimal point. Returns `None` for anything that isn't a
/// finite number.
pub fn parse_decimal(text: &str) -> Option<f64> {
    let text: String = text
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let last_comma = text.rfind(',');
    let last_dot = text.rfind('.');
    let canonical = match (last_comma, last_dot) {
        (Some(comma), Some(dot)) if comma > dot => text.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => text.replace(',', ""),
        (Some(_), None) if text.matches(',').count() == 1 => text.replace(',', "."),
        (Some(_), None) => text.replace(',', ""),
        (None, Some(_)) if text.matches('.').count() > 1 => text.replace('.', ""),
        _ => text,
    };
    canonical.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Expand one token, keeping the case style of the original.
fn expand_token(token: &str) -> Option<String> {
    let key = token.trim_end_matches('.').to_uppercase();
    let (_, expansion) = ABBREVIATIONS.iter().find(|(abbr, _)| *abbr == key)?;
    let has_lower = token.chars().any(char::is_lowercase);
    let first_upper = token.chars().next().is_some_and(char::is_uppercase);
    Some(if !has_lower {
        (*expansion).to_owned()
    } else if first_upper {
        let lower = expansion.to_lowercase();
        let mut chars = lower.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => lower,
        }
    } else {
        expansion.to_lowercase()
    })
}

/// Collapse whitespace and expand known abbreviations.
pub fn normalize_description(description: &str) -> String {
    description
        .split_whitespace()
        .map(|token| expand_token(token).unwrap_or_else(|| token.to_owned()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Is this line a total, tax, header or payment line?
pub fn is_noise_line(description: &str) -> bool {
    TOTALS_LINE_RE.is_match(description) || HEADER_LINE_RE.is_match(description)
}

/// Clean up a single item. Returns `None` if the item should be dropped.
pub fn normalize_line_item(item: ExtractedLineItem) -> Option<ExtractedLineItem> {
    if item.is_manual_entry_placeholder() {
        return Some(item);
    }
    let description = normalize_description(&item.description);
    if description.is_empty() || is_noise_line(&description) {
        trace!(description = %item.description, "Dropping non-product line");
        return None;
    }
    let unit = item.unit.trim();
    Some(ExtractedLineItem {
        description,
        quantity: if item.quantity.is_finite() && item.quantity > 0.0 {
            item.quantity
        } else {
            1.0
        },
        unit: if unit.is_empty() {
            DEFAULT_UNIT.to_owned()
        } else {
            unit.to_owned()
        },
        unit_price: if item.unit_price.is_finite() && item.unit_price >= 0.0 {
            item.unit_price
        } else {
            0.0
        },
    })
}

/// Clean up a whole invoice.
pub fn normalize_line_items(items: Vec<ExtractedLineItem>) -> Vec<ExtractedLineItem> {
    items.into_iter().filter_map(normalize_line_item).collect()
}
