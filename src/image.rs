//! Scan input images.
//!
//! Images arrive as raw bytes, as a file on disk, or as Base64 (optionally
//! wrapped in a `data:` URL, which is what browser uploads usually send). We
//! sniff the real content type from the bytes, since the declared one is often
//! wrong.

use std::{fmt, sync::LazyLock};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use regex::Regex;

use crate::prelude::*;

/// The content type we assume when sniffing fails. Phone cameras send JPEG.
const DEFAULT_MIME_TYPE: &str = "image/jpeg";

/// Regex for parsing a Base64 `data:` URL.
static DATA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^data:(?P<mime_type>[^;,]+)?(?:;[^;,]+)*;base64,(?P<data>.*)$")
        .expect("failed to compile regex")
});

/// An image to scan.
#[derive(Clone, PartialEq, Eq)]
pub struct ScanImage {
    data: Vec<u8>,
    mime_type: String,
}

impl ScanImage {
    /// Wrap raw image bytes, sniffing their content type.
    pub fn new(data: Vec<u8>) -> Self {
        let mime_type = infer::get(&data)
            .map(|kind| kind.mime_type().to_owned())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_owned());
        Self { data, mime_type }
    }

    /// Decode Base64 image data, either bare or as a `data:` URL.
    pub fn from_base64(input: &str) -> Result<Self> {
        let input = input.trim();
        let encoded = match DATA_URL_RE.captures(input) {
            Some(caps) => caps.name("data").map(|m| m.as_str()).unwrap_or_default(),
            None => input,
        };
        // Browsers and some tools wrap long Base64 lines.
        let encoded: String = encoded.split_whitespace().collect();
        let data = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .context("could not decode Base64 image data")?;
        if data.is_empty() {
            return Err(anyhow!("image data is empty"));
        }
        Ok(Self::new(data))
    }

    /// Read an image from disk.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read image {}", path.display()))?;
        if data.is_empty() {
            return Err(anyhow!("image {} is empty", path.display()));
        }
        Ok(Self::new(data))
    }

    /// The raw bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The sniffed content type.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The short file type label OCR providers expect, like "JPG" or "PDF".
    pub fn file_type(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "PNG",
            "image/gif" => "GIF",
            "image/bmp" => "BMP",
            "image/tiff" => "TIF",
            "image/webp" => "WEBP",
            "application/pdf" => "PDF",
            _ => "JPG",
        }
    }

    /// A file name to use in multipart uploads.
    pub fn file_name(&self) -> String {
        format!("scan.{}", self.file_type().to_ascii_lowercase())
    }

    /// Encode as a `data:` URL.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            BASE64_STANDARD.encode(&self.data)
        )
    }
}

impl fmt::Debug for ScanImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never dump image bytes into logs.
        f.debug_struct("ScanImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}
