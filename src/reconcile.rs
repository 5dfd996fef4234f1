//! Fuzzy matching of extracted line items against the product catalog.
//!
//! Scores are deliberately simple so that an operator can predict them:
//!
//! - 1.0 if the names are equal after normalization,
//! - 0.85 if one contains the other,
//! - otherwise the fraction of shared words longer than two characters.
//!
//! The best score picks a tier. Auto-linked items take their unit and price
//! from the catalog, suggestions are left for a human to confirm, and anything
//! else is unmatched.

use std::collections::HashSet;

use schemars::JsonSchema;

use crate::{catalog::ProductCandidate, items::ExtractedLineItem, prelude::*};

/// Score for equal names.
const EXACT_SCORE: f64 = 1.0;

/// Score when one name contains the other.
const CONTAINMENT_SCORE: f64 = 0.85;

/// Shorter words ("de", "p/", "c/") carry no signal.
const MIN_WORD_LEN: usize = 3;

/// Lowercase and strip Portuguese diacritics.
pub fn fold_text(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Folded text with everything but ASCII letters and digits removed.
fn compact(text: &str) -> String {
    fold_text(text)
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Significant words, folded.
fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(compact)
        .filter(|word| word.chars().count() >= MIN_WORD_LEN)
        .collect()
}

/// How similar are two product descriptions? Always in `0.0..=1.0`.
pub fn match_score(a: &str, b: &str) -> f64 {
    let (ca, cb) = (compact(a), compact(b));
    if ca == cb {
        return EXACT_SCORE;
    }
    if !ca.is_empty() && !cb.is_empty() && (ca.contains(&cb) || cb.contains(&ca)) {
        return CONTAINMENT_SCORE;
    }

    let (wa, wb) = (words(a), words(b));
    let set_b: HashSet<&str> = wb.iter().map(String::as_str).collect();
    let shared = wa
        .iter()
        .map(String::as_str)
        .collect::<HashSet<_>>()
        .intersection(&set_b)
        .count();
    shared as f64 / wa.len().max(wb.len()).max(1) as f64
}

/// Score thresholds for the confidence tiers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchThresholds {
    /// At or above this, link automatically.
    pub auto_link: f64,

    /// At or above this, suggest the product.
    pub suggest: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            auto_link: 0.75,
            suggest: 0.60,
        }
    }
}

/// What to do with a match.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    AutoLink,
    Suggest,
    NoMatch,
}

impl MatchThresholds {
    /// Pick the tier for a score.
    pub fn tier(&self, score: f64) -> MatchTier {
        if score >= self.auto_link {
            MatchTier::AutoLink
        } else if score >= self.suggest {
            MatchTier::Suggest
        } else {
            MatchTier::NoMatch
        }
    }
}

/// A line item after reconciliation.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledItem {
    #[serde(flatten)]
    pub item: ExtractedLineItem,

    /// The linked product, for confident matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,

    /// The best score, when it reached at least the suggestion tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_confidence: Option<f64>,

    /// A product the operator should consider, for plausible matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_product_id: Option<String>,
}

impl ReconciledItem {
    /// An item with no catalog match.
    pub fn unmatched(item: ExtractedLineItem) -> Self {
        Self {
            item,
            product_id: None,
            match_confidence: None,
            suggested_product_id: None,
        }
    }

    /// The tier this item ended up in.
    pub fn tier(&self) -> MatchTier {
        if self.product_id.is_some() {
            MatchTier::AutoLink
        } else if self.suggested_product_id.is_some() {
            MatchTier::Suggest
        } else {
            MatchTier::NoMatch
        }
    }
}

/// Links line items to catalog products.
#[derive(Clone, Debug, Default)]
pub struct ReconciliationEngine {
    thresholds: MatchThresholds,
}

impl ReconciliationEngine {
    /// Create an engine with custom thresholds.
    pub fn new(thresholds: MatchThresholds) -> Self {
        Self { thresholds }
    }

    /// The best-scoring product for `description`.
    ///
    /// Every candidate is scored. On ties, the earliest candidate wins.
    pub fn best_match<'a>(
        &self,
        description: &str,
        catalog: &'a [ProductCandidate],
    ) -> Option<(&'a ProductCandidate, f64)> {
        let mut best: Option<(&ProductCandidate, f64)> = None;
        for candidate in catalog {
            let score = match_score(description, &candidate.name);
            if score > best.map_or(0.0, |(_, s)| s) {
                best = Some((candidate, score));
            }
        }
        best
    }

    /// Reconcile one item.
    pub fn reconcile_item(
        &self,
        item: ExtractedLineItem,
        catalog: &[ProductCandidate],
    ) -> ReconciledItem {
        if item.is_manual_entry_placeholder() {
            return ReconciledItem::unmatched(item);
        }
        let Some((candidate, score)) = self.best_match(&item.description, catalog) else {
            trace!(description = %item.description, "No catalog match");
            return ReconciledItem::unmatched(item);
        };
        match self.thresholds.tier(score) {
            MatchTier::AutoLink => {
                debug!(
                    description = %item.description,
                    product = %candidate.name,
                    score,
                    "Auto-linked item"
                );
                ReconciledItem {
                    item: ExtractedLineItem {
                        unit: candidate.unit.clone(),
                        unit_price: candidate.cost,
                        ..item
                    },
                    product_id: Some(candidate.id.clone()),
                    match_confidence: Some(score),
                    suggested_product_id: None,
                }
            }
            MatchTier::Suggest => {
                debug!(
                    description = %item.description,
                    product = %candidate.name,
                    score,
                    "Suggesting product"
                );
                ReconciledItem {
                    item,
                    product_id: None,
                    match_confidence: Some(score),
                    suggested_product_id: Some(candidate.id.clone()),
                }
            }
            MatchTier::NoMatch => ReconciledItem::unmatched(item),
        }
    }

    /// Reconcile a whole invoice, keeping item order.
    pub fn reconcile(
        &self,
        items: Vec<ExtractedLineItem>,
        catalog: &[ProductCandidate],
    ) -> Vec<ReconciledItem> {
        items
            .into_iter()
            .map(|item| self.reconcile_item(item, catalog))
            .collect()
    }
}
