//! Image generation through the Gemini API, with the provider's failure
//! modes folded into three classes the gateway can phrase replies around.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

const IMAGE_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-preview-image-generation";
/// Prompts past this length are rejected before any network traffic.
pub const MAX_PROMPT_CHARS: usize = 2_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFailure {
    SafetyBlocked,
    RateLimited,
    Other,
}

#[derive(Debug, thiserror::Error)]
#[error("image error: {message}")]
pub struct ImageError {
    pub kind: ImageFailure,
    message: String,
}

impl ImageError {
    fn new(kind: ImageFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

pub struct ImageClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ImageClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .timeout(IMAGE_TIMEOUT)
            .build()
            .map_err(|err| {
                ImageError::new(ImageFailure::Other, format!("http client init failed: {err}"))
            })?;
        let model = model.into();
        Ok(Self {
            api_key: api_key.into(),
            model: if model.is_empty() {
                DEFAULT_IMAGE_MODEL.to_string()
            } else {
                model
            },
            client,
        })
    }

    pub async fn generate(&self, prompt: &str) -> Result<GeneratedImage, ImageError> {
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(ImageError::new(
                ImageFailure::Other,
                format!("prompt too long (limit {MAX_PROMPT_CHARS} characters)"),
            ));
        }

        let url = format!("{IMAGE_ENDPOINT}/{}:generateContent", self.model);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
        });
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| self.classify_transport(err))?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            ImageError::new(ImageFailure::Other, format!("image response read failed: {err}"))
        })?;

        if status.as_u16() == 429 {
            return Err(ImageError::new(
                ImageFailure::RateLimited,
                "image provider rate limit hit",
            ));
        }
        if !status.is_success() {
            return Err(self.classify_body(status.as_u16(), &text));
        }

        let value: Value = serde_json::from_str(&text).map_err(|err| {
            ImageError::new(ImageFailure::Other, format!("image response decode failed: {err}"))
        })?;

        // Structured safety feedback arrives with a 200 and no candidates.
        if let Some(reason) = value
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            return Err(ImageError::new(
                ImageFailure::SafetyBlocked,
                format!("image blocked: {reason}"),
            ));
        }

        let parts = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) else {
                continue;
            };
            let mime = part
                .pointer("/inlineData/mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string();
            let bytes = BASE64.decode(data).map_err(|err| {
                ImageError::new(ImageFailure::Other, format!("image decode failed: {err}"))
            })?;
            return Ok(GeneratedImage { bytes, mime });
        }

        Err(ImageError::new(
            ImageFailure::Other,
            "image response carried no image data",
        ))
    }

    fn classify_transport(&self, err: reqwest::Error) -> ImageError {
        let message = self.redact(&err.to_string());
        if err.is_timeout() {
            ImageError::new(ImageFailure::Other, format!("image request timed out: {message}"))
        } else {
            ImageError::new(ImageFailure::Other, format!("image request failed: {message}"))
        }
    }

    fn classify_body(&self, status: u16, body: &str) -> ImageError {
        let message = self.redact(body);
        let lower = message.to_ascii_lowercase();
        if lower.contains("safety") || lower.contains("blocked") {
            return ImageError::new(ImageFailure::SafetyBlocked, format!("image blocked: {message}"));
        }
        if lower.contains("rate limit") {
            return ImageError::new(ImageFailure::RateLimited, "image provider rate limit hit");
        }
        ImageError::new(
            ImageFailure::Other,
            format!("image request failed with status {status}: {message}"),
        )
    }

    fn redact(&self, text: &str) -> String {
        if self.api_key.is_empty() {
            return text.to_string();
        }
        text.replace(&self.api_key, "[redacted]")
    }
}
