use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::envfile;
use common::logging::{init_logging, LoggingConfig};
use common::settings::Settings;
use store::Store;
use tokio::sync::watch;

use claudegramd::agent::{AgentRunner, CliAgentClient};
use claudegramd::daemon::{cleanup_stale_uploads, CliArgs, DaemonError, PidLock};
use claudegramd::gateway::{Gateway, GatewayParts};
use claudegramd::imagegen::ImageClient;
use claudegramd::memory::MemoryCore;
use claudegramd::queue::ChatQueue;
use claudegramd::scheduler::Scheduler;
use claudegramd::speech::{SttClient, TtsClient};
use claudegramd::telegram::TelegramClient;
use claudegramd::webhook::WebhookClient;

const POLL_TIMEOUT_SECS: u64 = 30;
const DECAY_INTERVAL_SECS: u64 = 3_600;
const UPLOAD_CLEANUP_INTERVAL_SECS: u64 = 6 * 3_600;
const UPLOAD_MAX_AGE_SECS: u64 = 24 * 3_600;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("claudegramd startup failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DaemonError> {
    let cli = CliArgs::parse()?;
    let project_root = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .map_err(|err| DaemonError::new(format!("cwd resolve failed: {err}")))?,
    };

    let env_path = cli
        .env_file
        .clone()
        .unwrap_or_else(|| project_root.join(envfile::DEFAULT_ENV_PATH));
    let env = envfile::parse_env_file(&env_path);
    let settings = Arc::new(Settings::from_env_map(&env));

    init_logging(LoggingConfig {
        log_file: cli.log_file.clone(),
        ..Default::default()
    })
    .map_err(|err| DaemonError::new(format!("logging init failed: {err}")))?;

    if settings.telegram_bot_token.is_empty() {
        return Err(DaemonError::new(
            "TELEGRAM_BOT_TOKEN is not set; refusing to start",
        ));
    }
    // An empty allow-list would mean an open bot. Refuse instead.
    if settings.allowed_chat_ids.is_empty() {
        return Err(DaemonError::new(
            "ALLOWED_CHAT_IDS is empty; refusing to start an open gateway",
        ));
    }

    let store_dir = project_root.join("store");
    let lock = PidLock::acquire(store_dir.join("claudegramd.pid"))?;

    let store = Arc::new(
        Store::open(&store_dir.join("claudegram.db"))
            .map_err(|err| DaemonError::new(format!("store open failed: {err}")))?,
    );

    let uploads_dir = project_root.join("workspace").join("uploads");
    std::fs::create_dir_all(&uploads_dir)
        .map_err(|err| DaemonError::new(format!("uploads dir create failed: {err}")))?;

    let telegram = Arc::new(
        TelegramClient::new(settings.telegram_bot_token.clone())
            .map_err(|err| DaemonError::new(format!("telegram client init failed: {err}")))?,
    );

    let memory = Arc::new(MemoryCore::new(store.clone()));
    let queue = Arc::new(ChatQueue::default());
    let agent_client = Arc::new(
        CliAgentClient::new("claude", settings.system_prompt_append.clone())
            .with_workdir(project_root.join("workspace")),
    );
    let runner = Arc::new(AgentRunner::new(
        agent_client,
        env_path.clone(),
        settings.agent_timeout_ms,
    ));

    let stt = if settings.stt_enabled() {
        match SttClient::new(settings.stt_api_key.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                tracing::error!("stt client init failed: {err}");
                None
            }
        }
    } else {
        None
    };
    let tts = if settings.tts_enabled() {
        match TtsClient::new(settings.tts_api_key.clone(), settings.tts_voice_id.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                tracing::error!("tts client init failed: {err}");
                None
            }
        }
    } else {
        None
    };
    let webhook = if settings.webhook_enabled() {
        match WebhookClient::new(
            settings.webhook_base_url.clone(),
            settings.webhook_api_key.clone(),
        ) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                tracing::error!("webhook client init failed: {err}");
                None
            }
        }
    } else {
        None
    };
    let imagegen = if settings.image_enabled() {
        match ImageClient::new(settings.image_api_key.clone(), settings.image_model.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                tracing::error!("image client init failed: {err}");
                None
            }
        }
    } else {
        None
    };

    let gateway = Gateway::new(GatewayParts {
        settings: settings.clone(),
        store: store.clone(),
        queue,
        memory: memory.clone(),
        runner,
        transport: telegram.clone(),
        stt,
        tts,
        webhook,
        imagegen,
        uploads_dir: uploads_dir.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(store.clone(), gateway.clone());
    let scheduler_task = {
        let stop = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(stop).await })
    };

    let maintenance_task = {
        let memory = memory.clone();
        let uploads_dir = uploads_dir.clone();
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut decay_tick = tokio::time::interval(Duration::from_secs(DECAY_INTERVAL_SECS));
            let mut upload_tick =
                tokio::time::interval(Duration::from_secs(UPLOAD_CLEANUP_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = decay_tick.tick() => {
                        match memory.run_decay() {
                            Ok((decayed, deleted)) => {
                                tracing::info!("decay sweep: {decayed} decayed, {deleted} deleted");
                            }
                            Err(err) => tracing::error!("decay sweep failed: {err}"),
                        }
                    }
                    _ = upload_tick.tick() => {
                        let removed = cleanup_stale_uploads(&uploads_dir, UPLOAD_MAX_AGE_SECS);
                        if removed > 0 {
                            tracing::info!("removed {removed} stale uploads");
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    tracing::info!(
        "claudegramd up: {} allowed chats, store at {}",
        settings.allowed_chat_ids.len(),
        store_dir.display()
    );

    let offset_file = store_dir.join("telegram.offset");
    let poll_result = tokio::select! {
        result = run_polling_loop(&gateway, &telegram, &offset_file, shutdown_rx.clone()) => result,
        _ = wait_for_signal() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    // Best-effort teardown: everything after this line logs and continues.
    let _ = shutdown_tx.send(true);
    if let Err(err) = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = scheduler_task.await;
        let _ = maintenance_task.await;
    })
    .await
    {
        tracing::warn!("background tasks did not stop cleanly: {err}");
    }
    store.close();
    lock.release();

    poll_result.map_err(|err| DaemonError::new(format!("telegram loop failed: {err}")))
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!("SIGINT handler install failed: {err}");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!("SIGTERM handler install failed: {err}");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

async fn run_polling_loop(
    gateway: &Arc<Gateway>,
    telegram: &Arc<TelegramClient>,
    offset_file: &Path,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), claudegramd::telegram::TelegramError> {
    let mut offset = load_offset(offset_file);
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let updates = tokio::select! {
            updates = telegram.get_updates(offset, POLL_TIMEOUT_SECS) => updates,
            _ = shutdown.changed() => continue,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = update.update_id.saturating_add(1);
                    save_offset(offset_file, offset);
                    gateway.handle_update(update).await;
                }
            }
            Err(err) => {
                tracing::error!("telegram polling failed: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

fn load_offset(path: &Path) -> i64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

fn save_offset(path: &Path, offset: i64) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(err) = std::fs::write(path, format!("{offset}\n")) {
        tracing::warn!("telegram offset save failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::{load_offset, save_offset};

    #[test]
    fn offset_round_trips_and_defaults_to_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("telegram.offset");
        assert_eq!(load_offset(&path), 0);

        save_offset(&path, 44);
        assert_eq!(load_offset(&path), 44);
    }
}
