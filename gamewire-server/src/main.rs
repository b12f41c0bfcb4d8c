use anyhow::Context;
use gamewire_proto::{EventSender, HandlerRegistry, NetworkEvent};
use gamewire_server::config::ServerConfig;
use gamewire_server::handlers::{self, ServerContext};
use gamewire_server::Listener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config);

    info!("Gamewire Server v{} starting...", env!("CARGO_PKG_VERSION"));

    let psk = config.psk_bytes()?;
    info!("Encrypted packets use {}", config.security.cipher.name());

    // Register packet handlers before any socket traffic
    let registry = Arc::new(HandlerRegistry::new());
    let context = Arc::new(ServerContext {
        server_start_time: Instant::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });
    handlers::register_handlers(&registry, context).context("registering packet handlers")?;

    let (events, event_rx) = EventSender::channel();
    tokio::spawn(log_events(event_rx));

    let listener = Listener::new(
        registry,
        config.security.cipher,
        psk,
        config.listener_config(),
        events,
    );

    let addr = config.listen_socket_addr()?;
    let mut accept = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.bind(addr).await })
    };

    // Dispatch queued packets outside the read loops
    let tick = {
        let listener = listener.clone();
        let period = Duration::from_millis(config.limits.tick_millis);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                for conn in listener.connections() {
                    conn.process_packets();
                }
            }
        })
    };

    tokio::select! {
        result = &mut accept => {
            tick.abort();
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
        }
    }

    listener.shutdown().await;
    tick.abort();
    accept.await??;

    info!("Server stopped");
    Ok(())
}

async fn log_events(mut events: UnboundedReceiver<NetworkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::Connected { connection, .. } => {
                info!("Client connected: {} ({:?})", connection.id(), connection.remote_addr());
            }
            NetworkEvent::Disconnected { connection } => {
                info!("Client disconnected: {}", connection.id());
            }
            NetworkEvent::PacketReceived { connection, id } => {
                debug!("Packet {} queued on {}", id, connection.id());
            }
            NetworkEvent::NetworkError { connection, error } => {
                let id = connection.as_ref().map(|c| c.id().to_string()).unwrap_or_default();
                warn!("Network error on {}: {}", id, error);
            }
        }
    }
}

fn load_config() -> anyhow::Result<ServerConfig> {
    // Try to load from /etc/gamewire/server.toml first (production)
    if let Ok(config) = ServerConfig::from_file("/etc/gamewire/server.toml") {
        info!("Loaded config from /etc/gamewire/server.toml");
        return Ok(config);
    }

    // Try configs/server.toml (development)
    if let Ok(config) = ServerConfig::from_file("configs/server.toml") {
        info!("Loaded config from configs/server.toml");
        return Ok(config);
    }

    // Try ./server.toml (current directory)
    if let Ok(config) = ServerConfig::from_file("server.toml") {
        info!("Loaded config from server.toml");
        return Ok(config);
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(ServerConfig::default_config())
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));

    if config.logging.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
}
