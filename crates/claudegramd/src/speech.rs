//! Optional speech adapters: Whisper transcription in, ElevenLabs synthesis
//! out. Both activate only when their credentials are configured.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

const SPEECH_TIMEOUT: Duration = Duration::from_secs(30);
const STT_ENDPOINT: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const STT_MODEL: &str = "whisper-large-v3";
const TTS_ENDPOINT: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const TTS_MODEL: &str = "eleven_multilingual_v2";
/// Synthesis input is clipped; longer replies fall back to text anyway.
const TTS_MAX_CHARS: usize = 5_000;

#[derive(Debug, thiserror::Error)]
#[error("speech error: {message}")]
pub struct SpeechError {
    message: String,
}

impl SpeechError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct SttClient {
    api_key: String,
    client: reqwest::Client,
}

impl SttClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, SpeechError> {
        let client = reqwest::Client::builder()
            .timeout(SPEECH_TIMEOUT)
            .build()
            .map_err(|err| SpeechError::new(format!("http client init failed: {err}")))?;
        Ok(Self {
            api_key: api_key.into(),
            client,
        })
    }

    pub async fn transcribe(&self, audio_path: &Path) -> Result<String, SpeechError> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|err| SpeechError::new(format!("audio read failed: {err}")))?;
        let file_name = audio_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "voice.ogg".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/ogg")
            .map_err(|err| SpeechError::new(format!("audio part failed: {err}")))?;
        let form = reqwest::multipart::Form::new()
            .text("model", STT_MODEL)
            .part("file", part);

        let response = self
            .client
            .post(STT_ENDPOINT)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| SpeechError::new(format!("transcription request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SpeechError::new(format!(
                "transcription failed with status {}: {}",
                status.as_u16(),
                redact(&body, &self.api_key)
            )));
        }
        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|err| SpeechError::new(format!("transcription decode failed: {err}")))?;
        Ok(body.text)
    }
}

pub struct TtsClient {
    api_key: String,
    voice_id: String,
    client: reqwest::Client,
}

impl TtsClient {
    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> Result<Self, SpeechError> {
        let client = reqwest::Client::builder()
            .timeout(SPEECH_TIMEOUT)
            .build()
            .map_err(|err| SpeechError::new(format!("http client init failed: {err}")))?;
        Ok(Self {
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            client,
        })
    }

    /// Synthesize ogg/opus audio for up to [`TTS_MAX_CHARS`] of text.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
        let clipped: String = text.chars().take(TTS_MAX_CHARS).collect();
        let url = format!(
            "{TTS_ENDPOINT}/{}?output_format=opus_48000_64",
            self.voice_id
        );
        let response = self
            .client
            .post(url)
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({
                "text": clipped,
                "model_id": TTS_MODEL,
            }))
            .send()
            .await
            .map_err(|err| SpeechError::new(format!("synthesis request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SpeechError::new(format!(
                "synthesis failed with status {}: {}",
                status.as_u16(),
                redact(&body, &self.api_key)
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SpeechError::new(format!("synthesis read failed: {err}")))?;
        Ok(bytes.to_vec())
    }
}

fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "[redacted]")
}

#[cfg(test)]
mod tests {
    use super::redact;

    #[test]
    fn redaction_strips_the_key_everywhere() {
        let out = redact("bad key sk-123 in sk-123 twice", "sk-123");
        assert_eq!(out, "bad key [redacted] in [redacted] twice");
        assert_eq!(redact("nothing here", ""), "nothing here");
    }
}
