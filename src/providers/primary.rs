//! The primary provider: a structured receipt recognizer with an asynchronous
//! upload-then-poll API (Tabscanner's, specifically).
//!
//! Uploads return a job token. Polling that token eventually yields line items
//! or a failure. The provider tells us when it has already seen an image this
//! billing period, which makes the upload free.

use std::sync::Arc;

use leaky_bucket::RateLimiter;
use reqwest::{
    StatusCode,
    multipart::{Form, Part},
};

use crate::{
    image::ScanImage,
    items::{DEFAULT_UNIT, ExtractedLineItem},
    prelude::*,
    rate_limit::RateLimit,
};

use super::{ProviderResponse, classify_failure, transport_error, value_as_f64, value_as_string};

/// Default API root.
pub const DEFAULT_API_BASE: &str = "https://api.tabscanner.com/api/2";

/// Provider code for "limit exceeded".
const CODE_LIMIT_EXCEEDED: i64 = 300;

/// Provider code for "already processed" (a free cache hit).
const CODE_DUPLICATE: i64 = 301;

/// A successful upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    /// The job token to poll.
    pub token: String,

    /// Did the provider recognize this image from earlier? Those are free.
    pub duplicate: bool,

    /// The provider's message, if any.
    pub message: Option<String>,
}

/// What a single poll found.
#[derive(Clone, Debug, PartialEq)]
pub enum PollStatus {
    Pending,
    Processing,
    Done(Vec<ExtractedLineItem>),
    /// The provider processed the document and rejected it.
    Failed { message: String },
}

/// The primary provider's API.
#[async_trait]
pub trait PrimaryOcrClient: Send + Sync + 'static {
    /// Upload an image and start a job.
    async fn upload(&self, image: &ScanImage) -> ProviderResponse<UploadReceipt>;

    /// Check on a job.
    async fn poll(&self, token: &str) -> ProviderResponse<PollStatus>;
}

fn message_of(body: &Value) -> Option<String> {
    value_as_string(body.get("message"))
}

fn code_of(body: &Value) -> Option<i64> {
    body.get("code")
        .or_else(|| body.get("status_code"))
        .and_then(Value::as_i64)
}

/// Classify an upload response.
pub fn classify_upload(status: StatusCode, body: &str) -> ProviderResponse<UploadReceipt> {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return if status.is_success() {
            ProviderResponse::GenericError {
                message: format!("unreadable upload response: {}", body.trim()),
            }
        } else {
            classify_failure(Some(status), body.trim())
        };
    };

    let message = message_of(&json);
    let code = code_of(&json);
    if code == Some(CODE_LIMIT_EXCEEDED) {
        return ProviderResponse::QuotaError {
            message: message.unwrap_or_else(|| "limit exceeded".to_owned()),
        };
    }
    let success = json.get("success").and_then(Value::as_bool) == Some(true);
    if !status.is_success() || !success {
        let message = message.unwrap_or_else(|| format!("upload failed with HTTP {status}"));
        return classify_failure(Some(status), &message);
    }

    let Some(token) = value_as_string(json.get("token")) else {
        return ProviderResponse::GenericError {
            message: "upload succeeded but returned no token".to_owned(),
        };
    };
    let duplicate =
        json.get("duplicate").and_then(Value::as_bool) == Some(true) || code == Some(CODE_DUPLICATE);
    ProviderResponse::Success(UploadReceipt {
        token,
        duplicate,
        message,
    })
}

/// Read one provider line item. Items with no description are dropped.
fn line_item_from_json(item: &Value) -> Option<ExtractedLineItem> {
    let description =
        value_as_string(item.get("descClean")).or_else(|| value_as_string(item.get("desc")))?;
    let quantity = value_as_f64(item.get("qty"))
        .filter(|qty| *qty > 0.0)
        .unwrap_or(1.0);
    let unit = value_as_string(item.get("unit")).unwrap_or_else(|| DEFAULT_UNIT.to_owned());
    let unit_price = value_as_f64(item.get("unitPrice"))
        .or_else(|| value_as_f64(item.get("price")))
        .unwrap_or(0.0);
    Some(ExtractedLineItem {
        description,
        quantity,
        unit,
        unit_price,
    })
}

/// The job state, which the provider reports as a number or a word.
fn job_state(json: &Value) -> Option<i64> {
    let state = match json.get("status") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "pending" => Some(1),
            "processing" => Some(2),
            "done" | "complete" | "completed" => Some(3),
            "failed" | "error" => Some(4),
            _ => None,
        },
        _ => None,
    };
    state.or_else(|| json.get("status_code").and_then(Value::as_i64))
}

/// Classify a poll response.
pub fn classify_poll(status: StatusCode, body: &str) -> ProviderResponse<PollStatus> {
    let json = serde_json::from_str::<Value>(body).ok();
    let message = json.as_ref().and_then(message_of);
    if !status.is_success() {
        let message = message.unwrap_or_else(|| format!("poll failed with HTTP {status}"));
        return classify_failure(Some(status), &message);
    }
    let Some(json) = json else {
        return ProviderResponse::GenericError {
            message: format!("unreadable poll response: {}", body.trim()),
        };
    };
    if code_of(&json) == Some(CODE_LIMIT_EXCEEDED) {
        return ProviderResponse::QuotaError {
            message: message.unwrap_or_else(|| "limit exceeded".to_owned()),
        };
    }

    match job_state(&json) {
        Some(1) => ProviderResponse::Success(PollStatus::Pending),
        Some(2) => ProviderResponse::Success(PollStatus::Processing),
        Some(3) => {
            let items = json
                .pointer("/result/lineItems")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(line_item_from_json).collect())
                .unwrap_or_default();
            ProviderResponse::Success(PollStatus::Done(items))
        }
        Some(4) => ProviderResponse::Success(PollStatus::Failed {
            message: message.unwrap_or_else(|| "OCR processing failed".to_owned()),
        }),
        _ => match message {
            Some(message) if json.get("success").and_then(Value::as_bool) == Some(false) => {
                classify_failure(Some(status), &message)
            }
            _ => ProviderResponse::GenericError {
                message: format!("poll response had no job status: {}", body.trim()),
            },
        },
    }
}

/// HTTP client for the primary provider.
pub struct TabscannerClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl TabscannerClient {
    /// Create a new client. A missing key makes every call fail with
    /// `InvalidKey` rather than failing here, so plate scans still work.
    pub fn new(
        http: reqwest::Client,
        api_base: &str,
        api_key: Option<String>,
        rate_limit: Option<&RateLimit>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_owned(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            rate_limiter: rate_limit.map(|limit| Arc::new(limit.to_rate_limiter())),
        }
    }

    fn api_key<T>(&self) -> std::result::Result<&str, ProviderResponse<T>> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderResponse::InvalidKey {
                message: "TABSCANNER_API_KEY is not configured".to_owned(),
            })
    }

    async fn pace(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire_one().await;
        }
    }

    async fn read_body(response: reqwest::Response) -> (StatusCode, String) {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        (status, body)
    }
}

#[async_trait]
impl PrimaryOcrClient for TabscannerClient {
    #[instrument(level = "debug", skip_all, fields(mime_type = image.mime_type(), len = image.data().len()))]
    async fn upload(&self, image: &ScanImage) -> ProviderResponse<UploadReceipt> {
        let api_key = match self.api_key() {
            Ok(key) => key,
            Err(err) => return err,
        };
        let part = match Part::bytes(image.data().to_vec())
            .file_name(image.file_name())
            .mime_str(image.mime_type())
        {
            Ok(part) => part,
            Err(err) => return transport_error(&err),
        };
        let form = Form::new().part("file", part);

        self.pace().await;
        let response = self
            .http
            .post(format!("{}/process", self.api_base))
            .header("apikey", api_key)
            .multipart(form)
            .send()
            .await;
        match response {
            Ok(response) => {
                let (status, body) = Self::read_body(response).await;
                trace!(%status, %body, "Upload response");
                classify_upload(status, &body)
            }
            Err(err) => transport_error(&err),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn poll(&self, token: &str) -> ProviderResponse<PollStatus> {
        let api_key = match self.api_key() {
            Ok(key) => key,
            Err(err) => return err,
        };
        let response = self
            .http
            .get(format!("{}/result/{}", self.api_base, token))
            .header("apikey", api_key)
            .send()
            .await;
        match response {
            Ok(response) => {
                let (status, body) = Self::read_body(response).await;
                trace!(%status, %body, "Poll response");
                classify_poll(status, &body)
            }
            Err(err) => transport_error(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_success() {
        let r = classify_upload(
            StatusCode::OK,
            r#"{"success": true, "token": "tok1", "code": 200, "message": "ok"}"#,
        );
        assert_eq!(
            r,
            ProviderResponse::Success(UploadReceipt {
                token: "tok1".to_owned(),
                duplicate: false,
                message: Some("ok".to_owned()),
            })
        );
    }

    #[test]
    fn test_upload_duplicates() {
        for body in [
            r#"{"success": true, "token": "t", "duplicate": true}"#,
            r#"{"success": true, "token": "t", "code": 301}"#,
        ] {
            match classify_upload(StatusCode::OK, body) {
                ProviderResponse::Success(receipt) => assert!(receipt.duplicate, "{body}"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_upload_quota() {
        let r = classify_upload(
            StatusCode::OK,
            r#"{"success": false, "code": 300, "message": "Not enough credit"}"#,
        );
        assert!(matches!(r, ProviderResponse::QuotaError { .. }));
        let r = classify_upload(StatusCode::PAYMENT_REQUIRED, r#"{"message": "pay up"}"#);
        assert!(matches!(r, ProviderResponse::QuotaError { .. }));
    }

    #[test]
    fn test_upload_other_failures() {
        let r = classify_upload(StatusCode::UNAUTHORIZED, r#"{"message": "bad"}"#);
        assert!(matches!(r, ProviderResponse::InvalidKey { .. }));
        let r = classify_upload(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
        assert!(matches!(r, ProviderResponse::RateLimited { .. }));
        let r = classify_upload(StatusCode::INTERNAL_SERVER_ERROR, "<html>");
        assert!(matches!(r, ProviderResponse::GenericError { .. }));
        let r = classify_upload(StatusCode::OK, r#"{"success": true}"#);
        assert!(matches!(r, ProviderResponse::GenericError { .. }));
    }

    #[test]
    fn test_poll_states() {
        assert_eq!(
            classify_poll(StatusCode::OK, r#"{"status": 1}"#),
            ProviderResponse::Success(PollStatus::Pending)
        );
        assert_eq!(
            classify_poll(StatusCode::OK, r#"{"status": "processing"}"#),
            ProviderResponse::Success(PollStatus::Processing)
        );
        assert!(matches!(
            classify_poll(StatusCode::OK, r#"{"status": 4}"#),
            ProviderResponse::Success(PollStatus::Failed { .. })
        ));
        assert!(matches!(
            classify_poll(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderResponse::RateLimited { .. }
        ));
        assert!(matches!(
            classify_poll(StatusCode::OK, r#"{"code": 300, "message": "Limit Exceeded"}"#),
            ProviderResponse::QuotaError { .. }
        ));
    }

    #[test]
    fn test_poll_done_reads_line_items() {
        let body = r#"{
            "status": 3,
            "result": {
                "lineItems": [
                    {"descClean": "FILTRO OLEO", "desc": "FILT OLEO", "qty": "2", "unit": "pc", "unitPrice": "32,50"},
                    {"desc": "VELA", "unitPrice": 15},
                    {"qty": 1, "unitPrice": 99}
                ]
            }
        }"#;
        let ProviderResponse::Success(PollStatus::Done(items)) =
            classify_poll(StatusCode::OK, body)
        else {
            panic!("expected DONE");
        };
        assert_eq!(
            items,
            vec![
                ExtractedLineItem {
                    description: "FILTRO OLEO".to_owned(),
                    quantity: 2.0,
                    unit: "pc".to_owned(),
                    unit_price: 32.5,
                },
                ExtractedLineItem::single("VELA", 15.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_invalid_key() {
        let client = TabscannerClient::new(reqwest::Client::new(), DEFAULT_API_BASE, None, None);
        let r = client.poll("tok").await;
        assert!(matches!(r, ProviderResponse::InvalidKey { .. }));
        let r = client.upload(&ScanImage::new(vec![1, 2, 3])).await;
        assert!(matches!(r, ProviderResponse::InvalidKey { .. }));
    }
}
