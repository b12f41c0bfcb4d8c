use gamewire_proto::{CipherSuite, ConnectionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientSettings {
    pub username: String,
    pub server_addr: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub cipher: CipherSuite,
    /// Pre-shared key the cipher key is derived from (hex-encoded)
    #[serde(default)]
    pub psk: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Interval between packet dispatch passes
    #[serde(default = "default_tick")]
    pub tick_millis: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    30
}

fn default_tick() -> u64 {
    50
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            write_timeout_secs: default_write_timeout(),
            tick_millis: default_tick(),
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            client: ClientSettings {
                username: "player-1".to_string(),
                server_addr: "127.0.0.1".to_string(),
                server_port: 7777,
            },
            security: SecuritySettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.client.server_addr, self.client.server_port)
    }

    pub fn psk_bytes(&self) -> anyhow::Result<Vec<u8>> {
        hex::decode(&self.security.psk)
            .map_err(|_| anyhow::anyhow!("Invalid PSK: must be hex-encoded"))
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(self.timeouts.connect_timeout_secs),
            write_timeout: Duration::from_secs(self.timeouts.write_timeout_secs),
            ..ConnectionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [client]
            username = "alice"
            server_addr = "10.0.0.5"
            server_port = 7000

            [security]
            cipher = "chacha20poly1305"
            psk = "abcd"
            "#,
        )
        .unwrap();

        assert_eq!(config.server_address(), "10.0.0.5:7000");
        assert_eq!(config.security.cipher, CipherSuite::ChaCha20Poly1305);
        assert_eq!(config.psk_bytes().unwrap(), vec![0xab, 0xcd]);
        assert_eq!(config.timeouts.tick_millis, 50);
        assert_eq!(config.connection_config().connect_timeout, Duration::from_secs(10));
    }
}
