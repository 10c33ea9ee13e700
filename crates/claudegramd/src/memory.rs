//! Per-turn memory: context assembly before a turn, ingest after it, and the
//! hourly decay sweep.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use store::{now_secs, MemoryRow, Role, Sector, Store, StoreError, CONVERSATION_KEEP_PER_CHAT};

pub const MAX_MEMORIES_PER_CHAT: usize = 200;
const CONTEXT_SEARCH_LIMIT: usize = 3;
const CONTEXT_RECENT_LIMIT: usize = 5;
/// Salience bump applied when a memory is surfaced into context.
const SURFACE_TOUCH_DELTA: f64 = 0.1;
/// User messages shorter than this carry no episodic value.
const EPISODIC_MIN_CHARS: usize = 20;
const FACT_LINE_MIN_CHARS: usize = 10;
const FACT_LINE_MAX_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
#[error("memory error: {message}")]
pub struct MemoryError {
    message: String,
}

impl MemoryError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<StoreError> for MemoryError {
    fn from(err: StoreError) -> Self {
        Self::new(err.to_string())
    }
}

pub struct MemoryCore {
    store: Arc<Store>,
    fact_patterns: Vec<Regex>,
}

impl MemoryCore {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            fact_patterns: fact_patterns(),
        }
    }

    /// Assemble the `<memory-context>` block for a turn. Search hits get a
    /// salience touch; recent rows already surfaced by search are deduped
    /// out. Nothing to say yields an empty string.
    pub fn build_context(&self, chat_id: i64, user_msg: &str) -> Result<String, MemoryError> {
        let hits = self
            .store
            .search_memories(chat_id, user_msg, CONTEXT_SEARCH_LIMIT)?;
        let recent = self.store.recent_memories(chat_id, CONTEXT_RECENT_LIMIT)?;

        let hit_ids: HashSet<i64> = hits.iter().map(|memory| memory.id).collect();
        let recent: Vec<MemoryRow> = recent
            .into_iter()
            .filter(|memory| !hit_ids.contains(&memory.id))
            .collect();

        for memory in &hits {
            self.store.touch_memory(memory.id, SURFACE_TOUCH_DELTA)?;
        }

        if hits.is_empty() && recent.is_empty() {
            return Ok(String::new());
        }

        let mut out = String::from("<memory-context>\n");
        if !hits.is_empty() {
            out.push_str("## Relevant Memories\n");
            for memory in &hits {
                out.push_str(&format!(
                    "- [{}] {}\n",
                    memory.sector.as_str(),
                    memory.content
                ));
            }
        }
        if !recent.is_empty() {
            out.push_str("## Recent Memories\n");
            for memory in &recent {
                out.push_str(&format!(
                    "- [{}] {}\n",
                    memory.sector.as_str(),
                    memory.content
                ));
            }
        }
        out.push_str("</memory-context>");
        Ok(out)
    }

    /// Persist one completed turn: both log rows, an episodic memory for a
    /// substantial user message, semantic facts mined from the reply, then
    /// the per-chat cap.
    pub fn record_turn(
        &self,
        chat_id: i64,
        user_msg: &str,
        reply: &str,
        session_id: Option<&str>,
    ) -> Result<(), MemoryError> {
        self.store
            .append_conversation(chat_id, session_id, Role::User, user_msg)?;
        self.store
            .append_conversation(chat_id, session_id, Role::Assistant, reply)?;

        if user_msg.chars().count() > EPISODIC_MIN_CHARS && !user_msg.starts_with('/') {
            self.store
                .insert_memory(chat_id, None, user_msg, Sector::Episodic)?;
        }

        for fact in self.extract_facts(reply) {
            self.store
                .insert_memory(chat_id, None, &fact, Sector::Semantic)?;
        }

        let count = self.store.memory_count(chat_id)?;
        if count > MAX_MEMORIES_PER_CHAT {
            self.store
                .prune_memories(chat_id, count - MAX_MEMORIES_PER_CHAT)?;
        }
        Ok(())
    }

    /// Scan reply lines against the pattern list; the first matching pattern
    /// wins per line, capture group 1 is the fact.
    pub fn extract_facts(&self, reply: &str) -> Vec<String> {
        let mut facts = Vec::new();
        for line in reply.lines() {
            let line = line.trim();
            let length = line.chars().count();
            if !(FACT_LINE_MIN_CHARS..=FACT_LINE_MAX_CHARS).contains(&length) {
                continue;
            }
            for pattern in &self.fact_patterns {
                if let Some(captures) = pattern.captures(line) {
                    if let Some(fact) = captures.get(1) {
                        let fact = fact.as_str().trim();
                        if !fact.is_empty() {
                            facts.push(fact.chars().take(store::SEMANTIC_MAX_CHARS).collect());
                        }
                        break;
                    }
                }
            }
        }
        facts
    }

    /// Hourly maintenance: salience decay plus the conversation-log cap.
    pub fn run_decay(&self) -> Result<(usize, usize), MemoryError> {
        let counts = self.store.decay_memories(now_secs())?;
        for chat_id in self.store.chats_with_conversations()? {
            self.store
                .prune_conversations(chat_id, CONVERSATION_KEEP_PER_CHAT)?;
        }
        Ok(counts)
    }
}

fn fact_patterns() -> Vec<Regex> {
    // Ordered: the first match per line wins, so a line matching more than
    // one pattern resolves to the earliest entry here.
    let sources = [
        r"(?i)^(?:remember|note|important|fyi):\s*(.+)$",
        r"(?i)\b(?:your|the)\s+(?:name|email|phone|address|birthday|preference)s?\s+(?:is|are)\s+(.+)$",
        r"(?i)\bi\s+(?:always|prefer|like|use|want|need)\s+(.+)$",
        r"(?i)^(?:don't forget|keep in mind|worth noting):\s*(.+)$",
    ];
    sources
        .iter()
        .filter_map(|source| match Regex::new(source) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::error!("fact pattern failed to compile: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{MemoryCore, MAX_MEMORIES_PER_CHAT};
    use std::sync::Arc;
    use store::{Sector, Store};

    fn core() -> (Arc<Store>, MemoryCore) {
        let store = Arc::new(Store::open_in_memory().expect("open store"));
        let memory = MemoryCore::new(store.clone());
        (store, memory)
    }

    #[test]
    fn context_is_empty_for_a_blank_slate() {
        let (_store, memory) = core();
        assert_eq!(memory.build_context(1, "anything at all").expect("context"), "");
    }

    #[test]
    fn context_frames_and_dedupes_sections() {
        let (store, memory) = core();
        store
            .insert_memory(1, None, "prefers tea over coffee", Sector::Semantic)
            .expect("insert");
        store
            .insert_memory(1, None, "asked about the weather yesterday", Sector::Episodic)
            .expect("insert");

        // Every token of the query must hit: FTS terms joined by spaces are
        // an implicit AND.
        let context = memory.build_context(1, "tea coffee").expect("context");
        assert!(context.starts_with("<memory-context>"));
        assert!(context.ends_with("</memory-context>"));
        assert!(context.contains("## Relevant Memories"));
        assert!(context.contains("- [semantic] prefers tea over coffee"));
        assert!(context.contains("## Recent Memories"));
        assert!(context.contains("- [episodic] asked about the weather yesterday"));
        // The search hit must not be repeated in the recent section.
        assert_eq!(context.matches("prefers tea over coffee").count(), 1);
    }

    #[test]
    fn surfacing_touches_salience() {
        let (store, memory) = core();
        let id = store
            .insert_memory(1, None, "the garage code is 4512", Sector::Semantic)
            .expect("insert");

        memory.build_context(1, "garage code").expect("context");
        let rows = store.recent_memories(1, 1).expect("recent");
        assert_eq!(rows[0].id, id);
        assert!(rows[0].salience > 1.0);
    }

    #[test]
    fn record_turn_stores_log_and_episodic_memory() {
        let (store, memory) = core();
        memory
            .record_turn(
                1,
                "please plan my trip to Lisbon next month",
                "Sure, here is a draft itinerary.",
                Some("sess"),
            )
            .expect("record");

        assert_eq!(store.conversation_count(1).expect("count"), 2);
        let memories = store.recent_memories(1, 10).expect("recent");
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].sector, Sector::Episodic);
        assert!(memories[0].content.contains("Lisbon"));
    }

    #[test]
    fn short_and_command_messages_are_not_memorized() {
        let (store, memory) = core();
        memory.record_turn(1, "hi", "hello!", None).expect("record");
        memory
            .record_turn(1, "/schedule 0 9 * * * morning digest please", "ok", None)
            .expect("record");
        assert!(store.recent_memories(1, 10).expect("recent").is_empty());
        assert_eq!(store.conversation_count(1).expect("count"), 4);
    }

    #[test]
    fn fact_extraction_first_match_wins_per_line() {
        let (_store, memory) = core();
        let reply = "Here is what I found.\n\
                     Remember: the staging server is down on Fridays\n\
                     your email is ada@example.com\n\
                     I prefer responding in short paragraphs\n\
                     too short\n\
                     Worth noting: backups run at 02:00";
        let facts = memory.extract_facts(reply);
        assert_eq!(
            facts,
            vec![
                "the staging server is down on Fridays".to_string(),
                "ada@example.com".to_string(),
                "responding in short paragraphs".to_string(),
                "backups run at 02:00".to_string(),
            ]
        );
    }

    #[test]
    fn overlapping_line_resolves_to_the_earlier_pattern() {
        let (_store, memory) = core();
        // Matches both the don't-forget pattern (whole remainder) and the
        // your/the pattern (substring). The your/the pattern is ordered
        // first, so the cleaner substring capture wins.
        let facts = memory.extract_facts("Don't forget: your phone is 555-0100");
        assert_eq!(facts, vec!["555-0100".to_string()]);
    }

    #[test]
    fn ingest_prunes_past_the_cap() {
        let (store, memory) = core();
        let mut ids = Vec::new();
        for index in 0..MAX_MEMORIES_PER_CHAT {
            ids.push(
                store
                    .insert_memory(
                        1,
                        None,
                        &format!("filler memory number {index}"),
                        Sector::Episodic,
                    )
                    .expect("insert"),
            );
        }
        // Leave exactly one row at its default salience; every other row is
        // touched above it, so the untouched row is the prune victim.
        let victim = ids[0];
        for id in &ids[1..] {
            store.touch_memory(*id, 0.5).expect("touch");
        }
        // The incoming 201st row shares the victim's default salience; give
        // it a strictly newer accessed_at so the tie breaks on age.
        std::thread::sleep(std::time::Duration::from_millis(1100));

        memory
            .record_turn(
                1,
                "this message is long enough to become memory 201",
                "ok",
                None,
            )
            .expect("record");

        assert_eq!(store.memory_count(1).expect("count"), MAX_MEMORIES_PER_CHAT);
        let survivors = store.recent_memories(1, 300).expect("recent");
        assert!(survivors.iter().all(|m| m.id != victim));
    }
}
