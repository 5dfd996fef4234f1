//! Typed failures surfaced by the scan pipeline.
//!
//! Callers (usually a UI layer that shows a localized message) should match on
//! [`ScanErrorKind`], which is stable and enumerable. The detail string is for
//! logs only.

use std::fmt;

use schemars::JsonSchema;

use crate::prelude::*;

/// The kinds of failure a scan can report.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanErrorKind {
    /// The monthly quota is used up, locally or according to the provider.
    /// Normally handled by falling back to the secondary provider.
    QuotaExceeded,

    /// The provider is throttling us (HTTP 429). Not retried automatically.
    RateLimit,

    /// A provider rejected our credentials, or none were configured.
    InvalidApiKey,

    /// Polling ran out of attempts. The caller may resubmit.
    Timeout,

    /// The provider processed the document and rejected it.
    OcrFailed,

    /// No valid license plate could be read.
    PlateNotFound,

    /// A transport failure or an unclassified provider error.
    ProviderError,

    /// The quota counter store could not be read.
    StoreUnavailable,

    /// The product catalog snapshot could not be loaded.
    CatalogUnavailable,
}

impl ScanErrorKind {
    /// The wire name of this error kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ScanErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ScanErrorKind::RateLimit => "RATE_LIMIT",
            ScanErrorKind::InvalidApiKey => "INVALID_API_KEY",
            ScanErrorKind::Timeout => "TIMEOUT",
            ScanErrorKind::OcrFailed => "OCR_FAILED",
            ScanErrorKind::PlateNotFound => "PLATE_NOT_FOUND",
            ScanErrorKind::ProviderError => "PROVIDER_ERROR",
            ScanErrorKind::StoreUnavailable => "STORE_UNAVAILABLE",
            ScanErrorKind::CatalogUnavailable => "CATALOG_UNAVAILABLE",
        }
    }

    /// Could resubmitting the same image later plausibly succeed?
    ///
    /// Configuration errors and documents the provider has already rejected
    /// will fail the same way again.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            ScanErrorKind::InvalidApiKey
                | ScanErrorKind::OcrFailed
                | ScanErrorKind::PlateNotFound
        )
    }
}

impl fmt::Display for ScanErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scan failure: a stable [`ScanErrorKind`] plus a human-readable detail.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct ScanError {
    kind: ScanErrorKind,
    detail: String,
}

impl ScanError {
    /// Create a new error.
    pub fn new(kind: ScanErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// What kind of failure was this?
    pub fn kind(&self) -> ScanErrorKind {
        self.kind
    }

    /// Details for logging.
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_to_wire_name() {
        let json = serde_json::to_string(&ScanErrorKind::InvalidApiKey).unwrap();
        assert_eq!(json, "\"INVALID_API_KEY\"");
        assert_eq!(ScanErrorKind::InvalidApiKey.to_string(), "INVALID_API_KEY");
    }

    #[test]
    fn test_display_includes_kind_and_detail() {
        let err = ScanError::new(ScanErrorKind::Timeout, "12 attempts");
        assert_eq!(err.to_string(), "TIMEOUT: 12 attempts");
        assert_eq!(err.kind(), ScanErrorKind::Timeout);
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ScanErrorKind::Timeout.is_recoverable());
        assert!(ScanErrorKind::RateLimit.is_recoverable());
        assert!(!ScanErrorKind::OcrFailed.is_recoverable());
        assert!(!ScanErrorKind::InvalidApiKey.is_recoverable());
    }
}
