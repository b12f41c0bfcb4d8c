use crate::{encode_fixed, encode_variable, Result};
use bytes::Bytes;

/// Sent by a client right before it closes its side of the socket
pub const CLIENT_GOODBYE: u8 = 254;

/// Sent by a server right before it closes its side of the socket
pub const SERVER_GOODBYE: u8 = 255;

/// Packet ids shared by the bundled server and client
pub mod ids {
    /// Heartbeat request, id byte only
    pub const PING: u8 = 1;
    /// Heartbeat reply, id byte only
    pub const PONG: u8 = 2;
    /// Variable-length text, echoed back unchanged
    pub const ECHO: u8 = 3;
    /// Encrypted variable-length text, echoed back encrypted
    pub const SECURE_ECHO: u8 = 4;
    /// Server time request, id byte only
    pub const TIME: u8 = 5;
    /// Server status request, id byte only
    pub const STATUS: u8 = 6;
    /// Variable-length JSON reply to TIME and STATUS
    pub const INFO: u8 = 7;
}

pub fn ping() -> Result<Bytes> {
    encode_fixed(ids::PING, &[])
}

pub fn pong() -> Result<Bytes> {
    encode_fixed(ids::PONG, &[])
}

pub fn echo(text: &str) -> Result<Bytes> {
    encode_variable(ids::ECHO, text.as_bytes())
}

pub fn time_request() -> Result<Bytes> {
    encode_fixed(ids::TIME, &[])
}

pub fn status_request() -> Result<Bytes> {
    encode_fixed(ids::STATUS, &[])
}

pub fn info(json: &[u8]) -> Result<Bytes> {
    encode_variable(ids::INFO, json)
}
