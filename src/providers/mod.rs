//! Adapters for the external OCR providers.
//!
//! Provider responses are loosely shaped JSON. Each adapter reads them into a
//! [`ProviderResponse`] at the boundary, using pure classification functions
//! that we can test without a network. Nothing past this module looks at raw
//! provider JSON.

use std::time::Duration;

use reqwest::StatusCode;
use schemars::JsonSchema;

use crate::{error::ScanErrorKind, prelude::*};

pub mod fallback;
pub mod primary;

/// Which provider handled a scan.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    /// The structured, quota-limited invoice provider.
    Primary,
    /// The unstructured text provider.
    Fallback,
}

/// The classified outcome of one provider call.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderResponse<T> {
    Success(T),
    /// The provider says our quota is used up.
    QuotaError { message: String },
    /// The provider is throttling us.
    RateLimited { message: String },
    /// The provider rejected our credentials.
    InvalidKey { message: String },
    /// Anything else, including transport failures.
    GenericError { message: String },
}

impl<T> ProviderResponse<T> {
    /// The error kind for a failed response, or `None` for success.
    pub fn error_kind(&self) -> Option<ScanErrorKind> {
        match self {
            ProviderResponse::Success(_) => None,
            ProviderResponse::QuotaError { .. } => Some(ScanErrorKind::QuotaExceeded),
            ProviderResponse::RateLimited { .. } => Some(ScanErrorKind::RateLimit),
            ProviderResponse::InvalidKey { .. } => Some(ScanErrorKind::InvalidApiKey),
            ProviderResponse::GenericError { .. } => Some(ScanErrorKind::ProviderError),
        }
    }

    /// The error message for a failed response.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ProviderResponse::Success(_) => None,
            ProviderResponse::QuotaError { message }
            | ProviderResponse::RateLimited { message }
            | ProviderResponse::InvalidKey { message }
            | ProviderResponse::GenericError { message } => Some(message),
        }
    }
}

/// Classify a failed call from its HTTP status (if we got one) and the
/// provider's message.
///
/// Quota signals win over everything else, because they're what routes a
/// scan to the fallback provider.
pub fn classify_failure<T>(status: Option<StatusCode>, message: &str) -> ProviderResponse<T> {
    let lower = message.to_lowercase();
    let message = message.to_owned();
    if status == Some(StatusCode::PAYMENT_REQUIRED)
        || lower.contains("limit exceeded")
        || lower.contains("quota")
    {
        ProviderResponse::QuotaError { message }
    } else if matches!(status, Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN))
        || lower.contains("api key")
        || lower.contains("apikey")
    {
        ProviderResponse::InvalidKey { message }
    } else if status == Some(StatusCode::TOO_MANY_REQUESTS) {
        ProviderResponse::RateLimited { message }
    } else {
        ProviderResponse::GenericError { message }
    }
}

/// Classify a transport-level failure.
pub fn transport_error<T>(err: &reqwest::Error) -> ProviderResponse<T> {
    if err.is_timeout() {
        ProviderResponse::GenericError {
            message: format!("request timed out: {err}"),
        }
    } else {
        classify_failure(err.status(), &err.to_string())
    }
}

/// Build the HTTP client shared by both providers.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// Read a field that providers send as either a number or a string.
pub(crate) fn value_as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|n| n.is_finite()),
        Value::String(s) => crate::normalize::invoice::parse_decimal(s),
        _ => None,
    }
}

/// Read a field that providers send as either a string or a number.
pub(crate) fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
