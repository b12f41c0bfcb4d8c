use gamewire_proto::{
    ids, messages, CipherSuite, Connection, ConnectionConfig, EventSender,
    HandlerRegistry, LoginContext, ProcessedPacket, Result,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Game-side wrapper around one client connection
pub struct GameClient {
    connection: Connection,
}

impl GameClient {
    pub fn new(
        cipher: CipherSuite,
        psk: &[u8],
        config: ConnectionConfig,
        events: EventSender,
    ) -> Result<Self> {
        let registry = HandlerRegistry::new();
        register_handlers(&registry)?;

        let connection = Connection::new(
            gamewire_proto::Role::Client,
            Arc::new(registry),
            cipher.build(psk)?,
            config,
            events,
        );

        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn connect(&self, addr: &str, username: &str) -> Result<()> {
        info!("Connecting to {} as {}", addr, username);
        self.connection
            .connect(
                addr,
                Some(LoginContext {
                    username: username.to_string(),
                }),
            )
            .await
    }

    pub fn ping(&self) -> Result<()> {
        self.connection.send(messages::ping()?);
        Ok(())
    }

    pub fn echo(&self, text: &str) -> Result<()> {
        self.connection.send(messages::echo(text)?);
        Ok(())
    }

    pub fn secure_echo(&self, text: &str) {
        self.connection.send_encrypted(ids::SECURE_ECHO, text.as_bytes());
    }

    pub fn time(&self) -> Result<()> {
        self.connection.send(messages::time_request()?);
        Ok(())
    }

    pub fn status(&self) -> Result<()> {
        self.connection.send(messages::status_request()?);
        Ok(())
    }

    /// Runs callbacks for everything received since the last tick
    pub fn tick(&self) -> usize {
        self.connection.process_packets()
    }
}

/// Packets the client expects back from the server
pub fn register_handlers(registry: &HandlerRegistry) -> Result<()> {
    registry.register(ids::PONG, false, 1, |conn: &Connection, _: &ProcessedPacket| {
        debug!("PONG on {}", conn.id());
        println!("[OK] PONG");
    })?;
    registry.register(ids::ECHO, false, 0, |_: &Connection, packet: &ProcessedPacket| {
        println!("[OK] Echo: {}", String::from_utf8_lossy(&packet.payload));
    })?;
    registry.register(ids::SECURE_ECHO, true, 0, |_: &Connection, packet: &ProcessedPacket| {
        println!(
            "[OK] Secure echo ({}): {}",
            packet.cipher.name(),
            String::from_utf8_lossy(&packet.payload)
        );
    })?;
    registry.register(ids::INFO, false, 0, |_: &Connection, packet: &ProcessedPacket| {
        match serde_json::from_slice::<serde_json::Value>(&packet.payload) {
            Ok(value) => println!("[OK] Response: {}", value),
            Err(_) => println!("[ERROR] Malformed info packet"),
        }
    })?;

    Ok(())
}
