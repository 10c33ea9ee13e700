//! Cross-chat concurrency through the whole gateway: three chats fire at
//! once, and at most two agent runs may ever be in flight.

use async_trait::async_trait;
use claudegramd::agent::{
    AgentClient, AgentError, AgentEvent, AgentRunner, AgentStream, ResultEvent,
};
use claudegramd::gateway::{Gateway, GatewayParts};
use claudegramd::memory::MemoryCore;
use claudegramd::queue::ChatQueue;
use claudegramd::telegram::{Chat, ChatTransport, Message, TelegramError, Update};
use common::settings::Settings;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::Store;

struct SilentTransport {
    sent: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl ChatTransport for SilentTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        _markdown: bool,
    ) -> Result<(), TelegramError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((chat_id, text.to_string()));
        }
        Ok(())
    }

    async fn send_voice(&self, _chat_id: i64, _audio: Vec<u8>) -> Result<(), TelegramError> {
        Ok(())
    }

    async fn send_photo(
        &self,
        _chat_id: i64,
        _image: Vec<u8>,
        _mime: &str,
    ) -> Result<(), TelegramError> {
        Ok(())
    }

    async fn send_action(&self, _chat_id: i64, _action: &str) -> Result<(), TelegramError> {
        Ok(())
    }

    async fn download_file(
        &self,
        _file_id: &str,
        _dest_dir: &Path,
    ) -> Result<PathBuf, TelegramError> {
        Err(TelegramError::new("downloads are not faked"))
    }
}

/// Holds the "slot" for a while before producing its result, tracking how
/// many streams are concurrently live.
struct SlowStream {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    produced: bool,
}

#[async_trait]
impl AgentStream for SlowStream {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, AgentError> {
        if self.produced {
            return Ok(None);
        }
        let live = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.produced = true;
        Ok(Some(AgentEvent::Result(ResultEvent {
            subtype: "success".to_string(),
            result: Some("slow done".to_string()),
            ..Default::default()
        })))
    }
}

struct SlowClient {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentClient for SlowClient {
    async fn start(
        &self,
        _prompt: &str,
        _session_id: Option<&str>,
        _env: HashMap<String, String>,
    ) -> Result<Box<dyn AgentStream>, AgentError> {
        Ok(Box::new(SlowStream {
            active: self.active.clone(),
            peak: self.peak.clone(),
            produced: false,
        }))
    }
}

fn update(chat_id: i64, text: &str) -> Update {
    Update {
        update_id: 1,
        message: Some(Message {
            message_id: 1,
            chat: Chat { id: chat_id },
            text: Some(text.to_string()),
            caption: None,
            voice: None,
            photo: None,
            document: None,
        }),
    }
}

#[tokio::test]
async fn at_most_two_agent_runs_in_flight() {
    let mut env = HashMap::new();
    env.insert("ALLOWED_CHAT_IDS".to_string(), "1,2,3".to_string());
    let settings = Arc::new(Settings::from_env_map(&env));

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(Store::open_in_memory().expect("open store"));
    let uploads = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(SilentTransport {
        sent: Mutex::new(Vec::new()),
    });

    let gateway = Gateway::new(GatewayParts {
        settings,
        store: store.clone(),
        queue: Arc::new(ChatQueue::default()),
        memory: Arc::new(MemoryCore::new(store.clone())),
        runner: Arc::new(AgentRunner::new(
            Arc::new(SlowClient {
                active: active.clone(),
                peak: peak.clone(),
            }),
            PathBuf::from("/nonexistent/.env"),
            5_000,
        )),
        transport: transport.clone(),
        stt: None,
        tts: None,
        webhook: None,
        imagegen: None,
        uploads_dir: uploads.path().to_path_buf(),
    });

    for chat in 1..=3 {
        gateway
            .handle_update(update(chat, "please take your time with this one"))
            .await;
    }

    // Wait for all three replies to land.
    for _ in 0..300 {
        let delivered = transport
            .sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .filter(|(_, text)| text.contains("slow done"))
                    .count()
            })
            .unwrap_or(0);
        if delivered == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let delivered = transport.sent.lock().expect("sent").clone();
    assert_eq!(
        delivered
            .iter()
            .filter(|(_, text)| text.contains("slow done"))
            .count(),
        3,
        "all three chats must eventually get their reply"
    );
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "more than two agent runs overlapped"
    );
    assert!(peak.load(Ordering::SeqCst) >= 1);
}
