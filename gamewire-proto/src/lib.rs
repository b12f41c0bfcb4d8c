pub mod messages;
pub mod framing;
pub mod crypto;
pub mod registry;
pub mod events;
pub mod connection;

pub use messages::*;
pub use framing::*;
pub use crypto::*;
pub use registry::*;
pub use events::*;
pub use connection::*;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet id {0} is reserved for internal use")]
    ReservedId(u8),

    #[error("A handler is already registered for packet id {0}")]
    DuplicateHandler(u8),

    #[error("Unknown packet id: {0}")]
    UnknownPacket(u8),

    #[error("Invalid declared length {length} for packet id {id}")]
    InvalidLength { id: u8, length: usize },

    #[error("Packet id {id} too large: {length} bytes (max: {max})")]
    PacketTooLarge { id: u8, length: usize, max: usize },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid encryption key")]
    InvalidKey,

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
