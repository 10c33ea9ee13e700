//! Typed runtime settings assembled from the parsed `.env` map.
//!
//! Missing keys default to empty strings, which downstream code treats as
//! "feature disabled". Only the allow-list and the bot token are hard
//! requirements, enforced at startup rather than here.

use std::collections::HashMap;

use serde::Serialize;

pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 300_000;

#[derive(Clone, Debug, Serialize)]
pub struct Settings {
    pub telegram_bot_token: String,
    pub allowed_chat_ids: Vec<i64>,
    pub claude_oauth_token: String,
    pub anthropic_api_key: String,
    pub stt_api_key: String,
    pub tts_api_key: String,
    pub tts_voice_id: String,
    pub webhook_base_url: String,
    pub webhook_api_key: String,
    pub image_api_key: String,
    pub image_model: String,
    pub system_prompt_append: String,
    pub agent_timeout_ms: u64,
}

impl Settings {
    pub fn from_env_map(env: &HashMap<String, String>) -> Self {
        let get = |key: &str| env.get(key).cloned().unwrap_or_default();

        let agent_timeout_ms = match env.get("AGENT_TIMEOUT_MS") {
            Some(raw) if !raw.is_empty() => match raw.parse::<u64>() {
                Ok(value) if value > 0 => value,
                _ => {
                    tracing::warn!("invalid AGENT_TIMEOUT_MS value {raw:?}, using default");
                    DEFAULT_AGENT_TIMEOUT_MS
                }
            },
            _ => DEFAULT_AGENT_TIMEOUT_MS,
        };

        Self {
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            allowed_chat_ids: parse_chat_ids(&get("ALLOWED_CHAT_IDS")),
            claude_oauth_token: get("CLAUDE_CODE_OAUTH_TOKEN"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            stt_api_key: get("GROQ_API_KEY"),
            tts_api_key: get("ELEVENLABS_API_KEY"),
            tts_voice_id: get("ELEVENLABS_VOICE_ID"),
            webhook_base_url: get("N8N_BASE_URL"),
            webhook_api_key: get("N8N_API_KEY"),
            image_api_key: get("GEMINI_API_KEY"),
            image_model: get("GEMINI_IMAGE_MODEL"),
            system_prompt_append: get("CLAUDE_SYSTEM_PROMPT_APPEND"),
            agent_timeout_ms,
        }
    }

    pub fn chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chat_ids.contains(&chat_id)
    }

    pub fn stt_enabled(&self) -> bool {
        !self.stt_api_key.is_empty()
    }

    pub fn tts_enabled(&self) -> bool {
        !self.tts_api_key.is_empty() && !self.tts_voice_id.is_empty()
    }

    pub fn webhook_enabled(&self) -> bool {
        !self.webhook_base_url.is_empty()
    }

    pub fn image_enabled(&self) -> bool {
        !self.image_api_key.is_empty()
    }
}

/// Parse the comma-separated allow-list. Entries are accepted only when they
/// are an optionally-negated run of digits; anything else is dropped with a
/// warning.
fn parse_chat_ids(raw: &str) -> Vec<i64> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if !is_signed_integer(entry) {
            tracing::warn!("ignoring malformed chat id {entry:?} in allow-list");
            continue;
        }
        match entry.parse::<i64>() {
            Ok(id) => {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
            Err(_) => tracing::warn!("ignoring out-of-range chat id {entry:?} in allow-list"),
        }
    }
    out
}

fn is_signed_integer(entry: &str) -> bool {
    let digits = entry.strip_prefix('-').unwrap_or(entry);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::{parse_chat_ids, Settings, DEFAULT_AGENT_TIMEOUT_MS};
    use std::collections::HashMap;

    #[test]
    fn allow_list_accepts_only_signed_integers() {
        let ids = parse_chat_ids("123, -456, abc, 12x, +7, , 123");
        assert_eq!(ids, vec![123, -456]);
    }

    #[test]
    fn missing_keys_default_to_disabled() {
        let settings = Settings::from_env_map(&HashMap::new());
        assert!(settings.telegram_bot_token.is_empty());
        assert!(settings.allowed_chat_ids.is_empty());
        assert!(!settings.stt_enabled());
        assert!(!settings.tts_enabled());
        assert!(!settings.webhook_enabled());
        assert_eq!(settings.agent_timeout_ms, DEFAULT_AGENT_TIMEOUT_MS);
    }

    #[test]
    fn tts_requires_both_key_and_voice() {
        let mut env = HashMap::new();
        env.insert("ELEVENLABS_API_KEY".to_string(), "key".to_string());
        let settings = Settings::from_env_map(&env);
        assert!(!settings.tts_enabled());

        env.insert("ELEVENLABS_VOICE_ID".to_string(), "voice".to_string());
        let settings = Settings::from_env_map(&env);
        assert!(settings.tts_enabled());
    }

    #[test]
    fn invalid_timeout_falls_back_to_default() {
        let mut env = HashMap::new();
        env.insert("AGENT_TIMEOUT_MS".to_string(), "soon".to_string());
        let settings = Settings::from_env_map(&env);
        assert_eq!(settings.agent_timeout_ms, DEFAULT_AGENT_TIMEOUT_MS);

        env.insert("AGENT_TIMEOUT_MS".to_string(), "90000".to_string());
        let settings = Settings::from_env_map(&env);
        assert_eq!(settings.agent_timeout_ms, 90_000);
    }
}
