//! Collaborative editing WebSocket server
//! Exposes the sync gateway to clients as JSON text frames

use anyhow::Context;
use clap::Parser;
use collaboration::*;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaborative document editing server")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Store revisions as JSON files in this directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<CollabConfig> {
        let mut config = match &self.config {
            Some(path) => CollabConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CollabConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.server.bind_addr = bind.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.backend = StorageBackend::JsonFile;
            config.storage.data_dir = dir.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "collab_server=debug,collaboration=debug"
    } else {
        "collab_server=info,collaboration=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = cli.load_config()?;
    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    info!(
        "Collaboration server listening on: {} ({:?} storage)",
        config.server.bind_addr, config.storage.backend
    );

    let gateway = Arc::new(SyncGateway::from_config(config));
    tokio::spawn(housekeeping(gateway.clone()));

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, gateway.clone()));
    }

    Ok(())
}

/// Expire silent participants and compact logs clients no longer need
async fn housekeeping(gateway: Arc<SyncGateway>) {
    let period = (gateway.config().keep_alive_timeout() / 2).max(std::time::Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let expired = gateway.expire_idle().await;
        if expired > 0 {
            info!("Expired {} idle participants", expired);
        }
        gateway.compact_all().await;
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, gateway: Arc<SyncGateway>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let client_id = ClientId::new();
    gateway.connect(client_id, tx.clone()).await;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let replies = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => gateway.handle(client_id, message).await,
                    Err(e) => {
                        warn!("Unreadable message from {}: {}", addr, e);
                        vec![ServerMessage::from(&CollaborationError::from(e))]
                    }
                };
                for reply in replies {
                    if tx.send(reply).is_err() {
                        debug!("Send task for {} is gone", addr);
                        break;
                    }
                }
            }
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
            _ => {}
        }
    }

    gateway.disconnect(&client_id).await;
    send_task.abort();
    info!("Connection closed: {}", addr);
}
