pub mod commands;
pub mod database;
pub mod download;
pub mod logging;
pub mod settings;
pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use crate::commands::event::{OutboundEvent, Outbox};
use crate::database::Database;
use crate::download::{
    ChannelGateway, DelegationGateway, DisabledGateway, HttpRetriever, QueueManager, QueueOptions, Scheduler,
};
use crate::settings::QueueConfig;

/// Shared handles every command works against.
pub struct AppState {
    pub db: Arc<Database>,
    pub manager: QueueManager,
    pub scheduler: Scheduler,
    /// `None` when delegation to the client is switched off.
    pub gateway: Option<Arc<ChannelGateway>>,
    pub config: Mutex<QueueConfig>,
    pub download_dir: PathBuf,
}

/// Run the service: JSON requests in on stdin, replies and events out on
/// stdout, one document per line. Returns on EOF or Ctrl-C.
pub async fn run() -> Result<(), String> {
    let s = settings::load_settings();
    logging::init(s.debug_logs);
    info!("clip-harvester starting; debug_logs={}", s.debug_logs);

    let db = match s.database_path() {
        Some(path) => Database::open(path),
        None => Database::open_default(),
    }
    .map_err(|e| format!("failed to open store: {e}"))?;
    let db = Arc::new(db);
    let config = database::blocking(&db, |db| QueueConfig::load(db))
        .await
        .map_err(|e| format!("failed to load queue config: {e}"))?;

    let (outbox, mut out_rx) = Outbox::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let download_dir = PathBuf::from(&s.download_directory);

    let (gateway, delegate_rx) = if s.delegate_to_client {
        let (g, rx) = ChannelGateway::new(Duration::from_millis(s.delegation_timeout_ms));
        (Some(Arc::new(g)), Some(rx))
    } else {
        (None, None)
    };
    let delegation: Arc<dyn DelegationGateway> = match &gateway {
        Some(g) => g.clone(),
        None => Arc::new(DisabledGateway),
    };

    let manager = QueueManager::new(
        db.clone(),
        delegation,
        Arc::new(HttpRetriever::new(download_dir.clone())),
        QueueOptions::from_config(&config, &s),
        Some(events_tx),
    );
    let scheduler = Scheduler::new(
        db.clone(),
        manager.clone(),
        Arc::new(outbox.clone()),
        Duration::from_millis(config.check_interval_ms),
    );
    let auto_download = config.auto_download;
    let app = AppState {
        db,
        manager,
        scheduler,
        gateway,
        config: Mutex::new(config),
        download_dir,
    };

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = out_rx.recv().await {
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!("stdout closed: {e}");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    if let Some(mut rx) = delegate_rx {
        let out = outbox.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                out.emit(&OutboundEvent::Delegate(request));
            }
        });
    }
    {
        let out = outbox.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                out.emit(&OutboundEvent::Download(event));
            }
        });
    }

    if auto_download {
        app.scheduler.start();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = commands::handle_line(&app, &line).await;
                    outbox.reply(&reply);
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin read failed: {e}");
                    break;
                }
            },
        }
    }

    app.scheduler.stop();
    app.manager.stop();
    drop(outbox);
    // Give queued replies a moment to flush.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    info!("clip-harvester stopped");
    Ok(())
}
