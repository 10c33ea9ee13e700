//! On-disk behaviour that the in-memory unit tests cannot see: reopening the
//! same file, WAL mode, and schema idempotence.

use store::{NewUsage, Role, Sector, Store};

#[test]
fn state_survives_a_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("claudegram.db");

    {
        let store = Store::open(&path).expect("open");
        store.bind_session(1, "sess-a").expect("bind");
        store
            .insert_memory(1, None, "persisted across restarts", Sector::Semantic)
            .expect("memory");
        store
            .create_task(1, "daily digest", "0 9 * * *", 1_700_000_000)
            .expect("task");
        store
            .append_conversation(1, Some("sess-a"), Role::User, "hello")
            .expect("log");
        store
            .record_usage(&NewUsage {
                chat_id: 1,
                session_id: Some("sess-a"),
                input_tokens: 10,
                ..Default::default()
            })
            .expect("usage");
        store.close();
    }

    let store = Store::open(&path).expect("reopen");
    assert_eq!(
        store.session_for_chat(1).expect("session"),
        Some("sess-a".to_string())
    );
    assert_eq!(store.memory_count(1).expect("memories"), 1);
    assert_eq!(
        store
            .search_memories(1, "restarts", 3)
            .expect("search")
            .len(),
        1
    );
    assert_eq!(store.tasks_for_chat(1).expect("tasks").len(), 1);
    assert_eq!(store.conversation_count(1).expect("log"), 1);
    assert_eq!(store.last_cache_read("sess-a").expect("usage"), Some(0));
}

#[test]
fn opening_twice_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("claudegram.db");
    {
        let store = Store::open(&path).expect("first open");
        store.bind_session(5, "keep").expect("bind");
        store.close();
    }
    // A second open must run the schema batch again without clobbering data.
    let store = Store::open(&path).expect("second open");
    assert_eq!(
        store.session_for_chat(5).expect("session"),
        Some("keep".to_string())
    );
}
