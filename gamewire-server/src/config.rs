use crate::listener::ListenerConfig;
use gamewire_proto::{
    CipherSuite, ConnectionConfig, DEFAULT_MAX_PACKET_LENGTH, DEFAULT_RECEIVE_BUFFER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub limits: LimitsSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Pending-accept queue length for the passive socket
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecuritySettings {
    /// Cipher for packets registered as encrypted
    #[serde(default)]
    pub cipher: CipherSuite,
    /// Pre-shared key the cipher key is derived from (hex-encoded)
    #[serde(default)]
    pub psk: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsSettings {
    /// Maximum concurrent connections
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// Largest single socket read
    #[serde(default = "default_receive_buffer")]
    pub receive_buffer_bytes: usize,
    /// Largest frame length a peer may declare
    #[serde(default = "default_max_packet")]
    pub max_packet_bytes: usize,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// How long shutdown waits for clients to drain
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// SO_LINGER on accepted sockets
    #[serde(default = "default_linger")]
    pub linger_secs: u64,
    /// Interval between packet dispatch passes
    #[serde(default = "default_tick")]
    pub tick_millis: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

fn default_backlog() -> u32 {
    10_000
}

fn default_max_conns() -> usize {
    1000
}

fn default_receive_buffer() -> usize {
    DEFAULT_RECEIVE_BUFFER_SIZE
}

fn default_max_packet() -> usize {
    DEFAULT_MAX_PACKET_LENGTH
}

fn default_write_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_linger() -> u64 {
    5
}

fn default_tick() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_conns: default_max_conns(),
            receive_buffer_bytes: default_receive_buffer(),
            max_packet_bytes: default_max_packet(),
            write_timeout_secs: default_write_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            linger_secs: default_linger(),
            tick_millis: default_tick(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: ServerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            server: ServerSettings {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: 7777,
                backlog: default_backlog(),
            },
            security: SecuritySettings::default(),
            limits: LimitsSettings::default(),
            logging: LoggingSettings::default(),
        }
    }

    pub fn listen_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.listen_addr, self.server.listen_port);
        addr.parse()
            .map_err(|_| anyhow::anyhow!("Invalid listen address: {}", addr))
    }

    pub fn psk_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let psk = hex::decode(&self.security.psk)
            .map_err(|_| anyhow::anyhow!("Invalid PSK: must be hex-encoded"))?;

        if self.security.cipher != CipherSuite::None && psk.is_empty() {
            anyhow::bail!("Cipher {} requires a PSK", self.security.cipher.name());
        }

        Ok(psk)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            backlog: self.server.backlog,
            max_conns: self.limits.max_conns,
            drain_timeout: Duration::from_secs(self.limits.drain_timeout_secs),
            connection: ConnectionConfig {
                receive_buffer_size: self.limits.receive_buffer_bytes,
                max_packet_length: self.limits.max_packet_bytes,
                write_timeout: Duration::from_secs(self.limits.write_timeout_secs),
                linger: Some(Duration::from_secs(self.limits.linger_secs)),
                ..ConnectionConfig::default()
            },
        }
    }
}
