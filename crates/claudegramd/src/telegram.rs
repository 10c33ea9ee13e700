//! Telegram Bot API client: long-poll updates in, replies out, with size
//! gates on file downloads and the greedy message splitter.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const MAX_MESSAGE_LENGTH: usize = 4096;
pub const MAX_DOWNLOAD_BYTES: u64 = 10 * 1024 * 1024;
/// Fraction of the split window below which a newline/space split point is
/// considered too early and the next fallback applies.
const SPLIT_FLOOR_NUMERATOR: usize = 3;
const SPLIT_FLOOR_DENOMINATOR: usize = 10;
const RATE_RETRY_DEFAULT_SECS: u64 = 5;
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[error("telegram error: {message}")]
pub struct TelegramError {
    message: String,
}

impl TelegramError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub voice: Option<Voice>,
    pub photo: Option<Vec<PhotoSize>>,
    pub document: Option<Document>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub duration: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    pub file_size: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct FileInfo {
    file_path: Option<String>,
    file_size: Option<i64>,
}

#[derive(Serialize)]
struct GetUpdatesRequest<'a> {
    offset: i64,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[derive(Serialize)]
struct SendChatActionRequest<'a> {
    chat_id: i64,
    action: &'a str,
}

/// The slice of the Bot API the gateway consumes; tests substitute fakes.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str, markdown: bool)
        -> Result<(), TelegramError>;
    async fn send_voice(&self, chat_id: i64, audio: Vec<u8>) -> Result<(), TelegramError>;
    async fn send_photo(&self, chat_id: i64, image: Vec<u8>, mime: &str)
        -> Result<(), TelegramError>;
    async fn send_action(&self, chat_id: i64, action: &str) -> Result<(), TelegramError>;
    async fn download_file(&self, file_id: &str, dest_dir: &Path)
        -> Result<PathBuf, TelegramError>;
}

pub struct TelegramClient {
    bot_token: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>) -> Result<Self, TelegramError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| TelegramError::new(format!("http client init failed: {err}")))?;
        Ok(Self {
            bot_token: bot_token.into(),
            client,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{file_path}",
            self.bot_token
        )
    }

    /// Strip the bot token out of any text that might get logged or sent
    /// back to a chat.
    pub fn redact(&self, text: &str) -> String {
        if self.bot_token.is_empty() {
            return text.to_string();
        }
        text.replace(&self.bot_token, "[redacted]")
    }

    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout_secs,
            allowed_updates: &["message"],
        };
        // Long poll: the request timeout must outlive the poll timeout.
        let response = self
            .client
            .post(self.url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs.saturating_add(30)))
            .json(&request)
            .send()
            .await
            .map_err(|err| TelegramError::new(self.redact(&format!("getUpdates failed: {err}"))))?;
        let body: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|err| TelegramError::new(format!("getUpdates decode failed: {err}")))?;
        if !body.ok {
            return Err(TelegramError::new(format!(
                "getUpdates returned not ok: {}",
                body.description.unwrap_or_default()
            )));
        }
        Ok(body.result.unwrap_or_default())
    }

    async fn send_message_once(
        &self,
        chat_id: i64,
        text: &str,
        markdown: bool,
    ) -> Result<(), TelegramError> {
        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode: markdown.then_some("Markdown"),
        };
        let response = self
            .client
            .post(self.url("sendMessage"))
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                TelegramError::new(self.redact(&format!("sendMessage failed: {err}")))
            })?;
        let body: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|err| TelegramError::new(format!("sendMessage decode failed: {err}")))?;
        if !body.ok {
            return Err(TelegramError::new(format!(
                "sendMessage returned not ok: {}",
                body.description.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    /// Send with one rate-limit retry, then a plain-text retry when the
    /// Markdown variant keeps failing (usually broken entities in the text).
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        markdown: bool,
    ) -> Result<(), TelegramError> {
        let first = self.send_message_once(chat_id, text, markdown).await;
        let Err(err) = first else {
            return Ok(());
        };

        let message = err.to_string();
        if is_rate_limited(&message) {
            let wait = retry_after_seconds(&message).unwrap_or(RATE_RETRY_DEFAULT_SECS);
            tracing::warn!("telegram rate limited, retrying in {wait}s");
            tokio::time::sleep(Duration::from_secs(wait)).await;
            if self.send_message_once(chat_id, text, markdown).await.is_ok() {
                return Ok(());
            }
        }

        if markdown {
            tracing::warn!("formatted send failed ({message}), retrying as plain text");
            return self.send_message_once(chat_id, text, false).await;
        }
        Err(err)
    }

    async fn send_voice(&self, chat_id: i64, audio: Vec<u8>) -> Result<(), TelegramError> {
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("voice.ogg")
            .mime_str("audio/ogg")
            .map_err(|err| TelegramError::new(format!("voice part failed: {err}")))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("voice", part);
        let response = self
            .client
            .post(self.url("sendVoice"))
            .multipart(form)
            .send()
            .await
            .map_err(|err| TelegramError::new(self.redact(&format!("sendVoice failed: {err}"))))?;
        let body: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|err| TelegramError::new(format!("sendVoice decode failed: {err}")))?;
        if !body.ok {
            return Err(TelegramError::new(format!(
                "sendVoice returned not ok: {}",
                body.description.unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        image: Vec<u8>,
        mime: &str,
    ) -> Result<(), TelegramError> {
        let extension = if mime.contains("png") { "png" } else { "jpg" };
        let part = reqwest::multipart::Part::bytes(image)
            .file_name(format!("image.{extension}"))
            .mime_str(mime)
            .map_err(|err| TelegramError::new(format!("photo part failed: {err}")))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);
        let response = self
            .client
            .post(self.url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(|err| TelegramError::new(self.redact(&format!("sendPhoto failed: {err}"))))?;
        let body: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|err| TelegramError::new(format!("sendPhoto decode failed: {err}")))?;
        if !body.ok {
            return Err(TelegramError::new(format!(
                "sendPhoto returned not ok: {}",
                body.description.unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn send_action(&self, chat_id: i64, action: &str) -> Result<(), TelegramError> {
        let request = SendChatActionRequest { chat_id, action };
        let response = self
            .client
            .post(self.url("sendChatAction"))
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                TelegramError::new(self.redact(&format!("sendChatAction failed: {err}")))
            })?;
        let _: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|err| TelegramError::new(format!("sendChatAction decode failed: {err}")))?;
        Ok(())
    }

    /// Fetch a file to the uploads directory. Size is checked against the
    /// metadata before downloading and against the actual bytes after.
    async fn download_file(
        &self,
        file_id: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, TelegramError> {
        let response = self
            .client
            .post(self.url("getFile"))
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|err| TelegramError::new(self.redact(&format!("getFile failed: {err}"))))?;
        let body: ApiResponse<FileInfo> = response
            .json()
            .await
            .map_err(|err| TelegramError::new(format!("getFile decode failed: {err}")))?;
        let info = body
            .result
            .filter(|_| body.ok)
            .ok_or_else(|| TelegramError::new("getFile returned not ok"))?;

        // Pre-check against the advertised size, before any bytes move.
        if let Some(size) = info.file_size {
            ensure_download_size(size.max(0) as u64)?;
        }
        let file_path = info
            .file_path
            .ok_or_else(|| TelegramError::new("getFile returned no path"))?;

        let response = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|err| TelegramError::new(self.redact(&format!("download failed: {err}"))))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TelegramError::new(format!("download read failed: {err}")))?;
        // Post-check against what actually arrived.
        ensure_download_size(bytes.len() as u64)?;

        std::fs::create_dir_all(dest_dir)
            .map_err(|err| TelegramError::new(format!("uploads dir create failed: {err}")))?;
        let dest = dest_dir.join(upload_file_name(file_id, &file_path));
        std::fs::write(&dest, &bytes)
            .map_err(|err| TelegramError::new(format!("upload write failed: {err}")))?;
        Ok(dest)
    }
}

fn ensure_download_size(size: u64) -> Result<(), TelegramError> {
    if size > MAX_DOWNLOAD_BYTES {
        return Err(TelegramError::new(format!(
            "file too large: {size} bytes (limit {MAX_DOWNLOAD_BYTES})"
        )));
    }
    Ok(())
}

/// Upload names are `<epoch_ms>-<file_id_prefix>.<ext>`.
fn upload_file_name(file_id: &str, file_path: &str) -> String {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    let prefix: String = file_id.chars().take(8).collect();
    let extension = Path::new(file_path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_string())
        .unwrap_or_else(|| "bin".to_string());
    format!("{epoch_ms}-{prefix}.{extension}")
}

fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("too many requests") || lower.contains("retry after")
}

/// Pull the advertised delay out of a "retry after N" error string.
pub fn retry_after_seconds(message: &str) -> Option<u64> {
    let lower = message.to_ascii_lowercase();
    let index = lower.find("retry after")?;
    lower[index + "retry after".len()..]
        .split_whitespace()
        .next()
        .and_then(|token| {
            token
                .trim_matches(|ch: char| !ch.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
}

/// Greedy splitter: emit the remaining text when it fits, otherwise cut at
/// the last newline in the window, falling back to the last space, falling
/// back to a hard cut. Split points earlier than 30% of the window are
/// rejected. Leading whitespace of each following chunk is consumed.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() || max_len == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let floor = max_len * SPLIT_FLOOR_NUMERATOR / SPLIT_FLOOR_DENOMINATOR;
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_len {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window = &chars[start..start + max_len];
        let cut = window
            .iter()
            .rposition(|ch| *ch == '\n')
            .filter(|index| *index >= floor)
            .or_else(|| {
                window
                    .iter()
                    .rposition(|ch| *ch == ' ')
                    .filter(|index| *index >= floor)
            })
            .unwrap_or(max_len);

        chunks.push(chars[start..start + cut].iter().collect());
        start += cut;
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
    }

    chunks
}
