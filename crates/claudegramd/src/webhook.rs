//! Webhook invoker for the n8n-style automation endpoints behind the bot
//! commands. Failures come back as data, never as exceptions into the turn
//! pipeline.

use std::time::Duration;

use serde_json::Value;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
#[error("webhook error: {message}")]
pub struct WebhookError {
    message: String,
}

impl WebhookError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Uniform call result: `ok` plus either parsed data or an error string with
/// secrets already redacted.
#[derive(Clone, Debug)]
pub struct WebhookOutcome {
    pub ok: bool,
    pub data: Value,
    pub error: Option<String>,
}

impl WebhookOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }
}

pub struct WebhookClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|err| WebhookError::new(format!("http client init failed: {err}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    pub async fn call(&self, path: &str, params: Value) -> WebhookOutcome {
        let path = match sanitize_path(path) {
            Ok(path) => path,
            Err(err) => return WebhookOutcome::failure(err.to_string()),
        };

        let url = format!("{}/{path}", self.base_url);
        let mut request = self.client.post(&url).json(&params);
        if !self.api_key.is_empty() {
            request = request.header("X-Api-Key", &self.api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                // A timeout reads differently from a connection failure in
                // the reply the user sees.
                let reason = if err.is_timeout() {
                    format!("webhook timed out after {}s", WEBHOOK_TIMEOUT.as_secs())
                } else {
                    format!("webhook request failed: {err}")
                };
                return WebhookOutcome::failure(self.redact(&reason));
            }
        };

        let status = response.status();
        // Read the body exactly once as text, then try JSON; a parse failure
        // keeps the text as the payload.
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                return WebhookOutcome::failure(self.redact(&format!(
                    "webhook response read failed: {err}"
                )))
            }
        };
        let data = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text.clone()),
        };

        if !status.is_success() {
            return WebhookOutcome {
                ok: false,
                data,
                error: Some(self.redact(&format!("webhook returned status {}", status.as_u16()))),
            };
        }
        WebhookOutcome {
            ok: true,
            data,
            error: None,
        }
    }

    fn redact(&self, text: &str) -> String {
        if self.api_key.is_empty() {
            return text.to_string();
        }
        text.replace(&self.api_key, "[redacted]")
    }
}

/// Webhook paths are caller-supplied; keep them boring. Each `/`-separated
/// segment must be non-empty, free of backslashes, not a dot navigation, and
/// limited to `[A-Za-z0-9_-]`.
pub fn sanitize_path(path: &str) -> Result<String, WebhookError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(WebhookError::new("empty webhook path"));
    }
    if trimmed.contains('\\') {
        return Err(WebhookError::new("webhook path may not contain backslashes"));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() {
            return Err(WebhookError::new("webhook path has an empty segment"));
        }
        if segment == "." || segment == ".." {
            return Err(WebhookError::new("webhook path may not navigate"));
        }
        if !segment
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-')
        {
            return Err(WebhookError::new(format!(
                "webhook path segment {segment:?} has forbidden characters"
            )));
        }
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::sanitize_path;

    #[test]
    fn accepts_plain_segments() {
        assert_eq!(sanitize_path("gmail").expect("path"), "gmail");
        assert_eq!(
            sanitize_path("/hooks/todo-list_v2/").expect("path"),
            "hooks/todo-list_v2"
        );
    }

    #[test]
    fn rejects_navigation_and_odd_characters() {
        assert!(sanitize_path("").is_err());
        assert!(sanitize_path("//").is_err());
        assert!(sanitize_path("a//b").is_err());
        assert!(sanitize_path("..").is_err());
        assert!(sanitize_path("a/../b").is_err());
        assert!(sanitize_path("a/./b").is_err());
        assert!(sanitize_path("a\\b").is_err());
        assert!(sanitize_path("a b").is_err());
        assert!(sanitize_path("a?x=1").is_err());
        assert!(sanitize_path("café").is_err());
    }
}
