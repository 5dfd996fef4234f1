//! The fallback provider: a generic text recognizer (OCR.space) with a single
//! synchronous call.
//!
//! It returns unstructured text, which is parsed into line items or searched
//! for a plate by the caller. It's also what we use for plates in the first
//! place, since there's nothing to poll for.

use reqwest::{StatusCode, multipart::Form};

use crate::{image::ScanImage, prelude::*};

use super::{ProviderResponse, classify_failure, transport_error};

/// Default endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.ocr.space/parse/image";

/// The provider's public demo key.
pub const DEMO_API_KEY: &str = "helloworld";

/// Which recognition engine to ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextMode {
    /// Dense text and tables, for invoices.
    Document,
    /// Short, large text, for license plates.
    Plate,
}

impl TextMode {
    /// The provider's engine number.
    fn engine(self) -> &'static str {
        match self {
            TextMode::Document => "2",
            TextMode::Plate => "1",
        }
    }
}

/// The fallback provider's API.
#[async_trait]
pub trait FallbackOcrClient: Send + Sync + 'static {
    /// Recognize all the text in an image.
    async fn recognize_text(&self, image: &ScanImage, mode: TextMode)
    -> ProviderResponse<String>;
}

/// The response body. Field names are the provider's.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrSpaceResponse {
    #[serde(default)]
    is_errored_on_processing: bool,
    /// A string or a list of strings, depending on the error.
    #[serde(default)]
    error_message: Option<Value>,
    #[serde(default)]
    parsed_results: Vec<ParsedResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParsedResult {
    #[serde(default)]
    parsed_text: String,
}

fn error_message_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

/// Classify a response.
pub fn classify_text_response(status: StatusCode, body: &str) -> ProviderResponse<String> {
    let parsed = serde_json::from_str::<OcrSpaceResponse>(body);
    if !status.is_success() {
        let message = parsed
            .ok()
            .and_then(|r| error_message_text(r.error_message.as_ref()))
            .unwrap_or_else(|| body.trim().to_owned());
        return classify_failure(Some(status), &message);
    }
    // The provider answers some key errors with a bare string and HTTP 200.
    let Ok(parsed) = parsed else {
        return classify_failure(None, &format!("unreadable OCR response: {}", body.trim()));
    };
    if parsed.is_errored_on_processing {
        let message = error_message_text(parsed.error_message.as_ref())
            .unwrap_or_else(|| "OCR processing failed".to_owned());
        return classify_failure(None, &message);
    }
    let text = parsed
        .parsed_results
        .into_iter()
        .next()
        .map(|r| r.parsed_text)
        .unwrap_or_default();
    ProviderResponse::Success(text)
}

/// HTTP client for the fallback provider.
pub struct OcrSpaceClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OcrSpaceClient {
    /// Create a new client.
    pub fn new(http: reqwest::Client, api_base: &str, api_key: &str) -> Self {
        Self {
            http,
            api_base: api_base.to_owned(),
            api_key: api_key.to_owned(),
        }
    }
}

#[async_trait]
impl FallbackOcrClient for OcrSpaceClient {
    #[instrument(level = "debug", skip_all, fields(mode = ?mode, len = image.data().len()))]
    async fn recognize_text(
        &self,
        image: &ScanImage,
        mode: TextMode,
    ) -> ProviderResponse<String> {
        let form = Form::new()
            .text("base64Image", image.to_data_url())
            .text("isOverlayRequired", "false")
            .text("filetype", image.file_type())
            .text("detectOrientation", "true")
            .text("scale", "true")
            .text("OCREngine", mode.engine());
        let response = self
            .http
            .post(&self.api_base)
            .header("apikey", &self.api_key)
            .multipart(form)
            .send()
            .await;
        match response {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                trace!(%status, %body, "OCR response");
                classify_text_response(status, &body)
            }
            Err(err) => transport_error(&err),
        }
    }
}
