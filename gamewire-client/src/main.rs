mod config;
mod client;

use crate::client::GameClient;
use crate::config::ClientConfig;
use gamewire_proto::{EventSender, NetworkEvent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();

    info!("Gamewire Client v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config()?;
    let psk = config.psk_bytes()?;

    let (events, mut event_rx) = EventSender::channel();
    let client = Arc::new(GameClient::new(
        config.security.cipher,
        &psk,
        config.connection_config(),
        events,
    )?);

    let server_addr = config.server_address();
    if let Err(e) = client.connect(&server_addr, &config.client.username).await {
        error!("Failed to connect: {}", e);
        return Err(e.into());
    }

    // Surface disconnects and network errors to the user
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                NetworkEvent::Disconnected { .. } => {
                    println!("\n[DISCONNECTED] Server closed the connection")
                }
                NetworkEvent::NetworkError { error, .. } => warn!("Network error: {}", error),
                _ => {}
            }
        }
    });

    // Run packet callbacks on a tick, away from the read loop
    let tick = {
        let client = client.clone();
        let period = Duration::from_millis(config.timeouts.tick_millis);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                client.tick();
            }
        })
    };

    println!("\nGamewire client connected to {}.", server_addr);
    println!("Available commands: ping, echo <text>, secure <text>, time, status, quit");
    println!("Type a command and press Enter:\n");

    // Interactive command loop
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        print!("> ");
        // Manually flush stdout since print! doesn't auto-flush
        use std::io::Write;
        std::io::stdout().flush()?;

        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        }

        let input = line.trim();

        if input.is_empty() {
            continue;
        }

        if input == "quit" || input == "exit" {
            info!("Exiting...");
            break;
        }

        if !client.connection().is_connected() {
            println!("[ERROR] Not connected");
            break;
        }

        // Parse command
        let parts: Vec<&str> = input.splitn(2, ' ').collect();
        let cmd = parts[0].to_lowercase();
        let text = if parts.len() > 1 { parts[1] } else { "" };

        let sent = match cmd.as_str() {
            "ping" => client.ping(),
            "time" => client.time(),
            "status" => client.status(),
            "echo" | "secure" if text.is_empty() => {
                println!("Error: {} requires text argument", cmd);
                continue;
            }
            "echo" => client.echo(text),
            "secure" => {
                client.secure_echo(text);
                Ok(())
            }
            _ => {
                println!("Unknown command: {}", cmd);
                continue;
            }
        };

        if let Err(e) = sent {
            warn!("Command failed: {}", e);
            println!("[ERROR] {}", e);
        }
    }

    client.connection().disconnect();
    client.connection().closed().await;
    tick.abort();

    Ok(())
}

fn load_config() -> anyhow::Result<ClientConfig> {
    // Try configs/client.toml (development)
    if let Ok(config) = ClientConfig::from_file("configs/client.toml") {
        info!("Loaded config from configs/client.toml");
        return Ok(config);
    }

    // Try ./client.toml (current directory)
    if let Ok(config) = ClientConfig::from_file("client.toml") {
        info!("Loaded config from client.toml");
        return Ok(config);
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(ClientConfig::default_config())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
