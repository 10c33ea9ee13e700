//! `.env` file parsing without touching the process environment.
//!
//! Secrets handed to the agent subprocess come from this file, never from
//! `std::env`, so nothing here calls `set_var`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

pub const DEFAULT_ENV_PATH: &str = ".env";

static DEFAULT_CACHE: Mutex<Option<HashMap<String, String>>> = Mutex::new(None);

/// Parse the default `.env` file, caching the result for the process lifetime.
///
/// Only the default path is cached; explicit paths passed to
/// [`parse_env_file`] bypass the cache entirely.
pub fn load_default() -> HashMap<String, String> {
    if let Ok(mut guard) = DEFAULT_CACHE.lock() {
        if let Some(cached) = guard.as_ref() {
            return cached.clone();
        }
        let parsed = parse_env_file(Path::new(DEFAULT_ENV_PATH));
        *guard = Some(parsed.clone());
        return parsed;
    }
    parse_env_file(Path::new(DEFAULT_ENV_PATH))
}

/// Drop the cached default-path parse. Test hook.
pub fn reset_cache() {
    if let Ok(mut guard) = DEFAULT_CACHE.lock() {
        *guard = None;
    }
}

/// Parse a `KEY=VALUE` file into a map. A missing file yields an empty map.
pub fn parse_env_file(path: &Path) -> HashMap<String, String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(_) => return HashMap::new(),
    };

    let mut out = HashMap::new();
    for line in contents.lines() {
        if let Some((key, value)) = parse_line(line) {
            out.insert(key, value);
        }
    }
    out
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let (raw_key, raw_value) = trimmed.split_once('=')?;
    let key = raw_key.trim_end().to_string();
    if key.is_empty() {
        return None;
    }

    let value = raw_value.trim();
    if let Some(unquoted) = strip_matched_quotes(value) {
        return Some((key, unquoted.to_string()));
    }

    // Unquoted values may carry an inline comment: everything from " #" on
    // is dropped.
    let value = match value.find(" #") {
        Some(index) => value[..index].trim_end(),
        None => value,
    };
    Some((key, value.to_string()))
}

fn strip_matched_quotes(value: &str) -> Option<&str> {
    let bytes = value.as_bytes();
    if bytes.len() < 2 {
        return None;
    }
    let first = bytes[0];
    let last = bytes[bytes.len() - 1];
    if first == last && (first == b'"' || first == b'\'') {
        return Some(&value[1..value.len() - 1]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{load_default, parse_env_file, parse_line, reset_cache};
    use std::io::Write;

    #[test]
    fn default_cache_is_stable_and_resettable() {
        reset_cache();
        let first = load_default();
        let second = load_default();
        assert_eq!(first, second);
        reset_cache();
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let map = parse_env_file(std::path::Path::new("/nonexistent/claudegram.env"));
        assert!(map.is_empty());
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("# TELEGRAM_BOT_TOKEN=x"), None);
    }

    #[test]
    fn splits_on_first_equals_only() {
        let parsed = parse_line("WEBHOOK_URL=https://host/path?a=1");
        assert_eq!(
            parsed,
            Some((
                "WEBHOOK_URL".to_string(),
                "https://host/path?a=1".to_string()
            ))
        );
    }

    #[test]
    fn strips_matched_quotes_and_keeps_interior_verbatim() {
        let parsed = parse_line("GREETING=\"hello # not a comment\"");
        assert_eq!(
            parsed,
            Some(("GREETING".to_string(), "hello # not a comment".to_string()))
        );
        let single = parse_line("KEY='  spaced  '");
        assert_eq!(single, Some(("KEY".to_string(), "  spaced  ".to_string())));
    }

    #[test]
    fn mismatched_quotes_are_kept() {
        let parsed = parse_line("KEY=\"unterminated");
        assert_eq!(parsed, Some(("KEY".to_string(), "\"unterminated".to_string())));
    }

    #[test]
    fn drops_inline_comment_from_unquoted_value() {
        let parsed = parse_line("TIMEOUT_MS=30000 # half a minute");
        assert_eq!(parsed, Some(("TIMEOUT_MS".to_string(), "30000".to_string())));
    }

    #[test]
    fn key_whitespace_is_trimmed() {
        let parsed = parse_line("KEY  = value");
        assert_eq!(parsed, Some(("KEY".to_string(), "value".to_string())));
    }

    #[test]
    fn parses_a_full_file_and_does_not_touch_process_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.env");
        let mut file = std::fs::File::create(&path).expect("create env file");
        writeln!(file, "# comment").expect("write");
        writeln!(file, "TELEGRAM_BOT_TOKEN=123:abc").expect("write");
        writeln!(file, "ALLOWED_CHAT_IDS=\"1, -2\"").expect("write");
        writeln!(file, "EMPTY=").expect("write");

        let map = parse_env_file(&path);
        assert_eq!(map.get("TELEGRAM_BOT_TOKEN").map(String::as_str), Some("123:abc"));
        assert_eq!(map.get("ALLOWED_CHAT_IDS").map(String::as_str), Some("1, -2"));
        assert_eq!(map.get("EMPTY").map(String::as_str), Some(""));
        assert!(std::env::var("TELEGRAM_BOT_TOKEN").is_err());
    }
}
