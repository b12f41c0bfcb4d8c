use bytes::Bytes;
use gamewire_proto::{encode_variable, ids, messages, Connection, HandlerRegistry, ProcessedPacket};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Server state that handlers can access
pub struct ServerContext {
    pub server_start_time: Instant,
    pub version: String,
}

/// Registers the packet handlers the bundled server answers
pub fn register_handlers(
    registry: &HandlerRegistry,
    ctx: Arc<ServerContext>,
) -> gamewire_proto::Result<()> {
    registry.register(ids::PING, false, 1, on_ping)?;
    registry.register(ids::ECHO, false, 0, on_echo)?;
    registry.register(ids::SECURE_ECHO, true, 0, on_secure_echo)?;
    registry.register(ids::TIME, false, 1, |conn: &Connection, _: &ProcessedPacket| {
        reply_json(conn, cmd_time())
    })?;
    registry.register(ids::STATUS, false, 1, move |conn: &Connection, _: &ProcessedPacket| {
        reply_json(conn, cmd_status(&ctx))
    })?;

    Ok(())
}

/// PING - answers PONG
fn on_ping(conn: &Connection, _packet: &ProcessedPacket) {
    debug!("PING from {}", conn.id());
    reply(conn, messages::pong());
}

/// ECHO - sends the payload straight back
fn on_echo(conn: &Connection, packet: &ProcessedPacket) {
    debug!("ECHO of {} bytes from {}", packet.payload.len(), conn.id());
    reply(conn, encode_variable(ids::ECHO, &packet.payload));
}

/// SECURE_ECHO - sends the decrypted payload back encrypted
fn on_secure_echo(conn: &Connection, packet: &ProcessedPacket) {
    debug!("SECURE_ECHO ({}) from {}", packet.cipher.name(), conn.id());
    conn.send_encrypted(ids::SECURE_ECHO, &packet.payload);
}

/// TIME - returns server timestamp
fn cmd_time() -> Value {
    let now = chrono::Utc::now();

    json!({
        "timestamp": now.timestamp(),
        "iso8601": now.to_rfc3339(),
    })
}

/// STATUS - returns server version and uptime
fn cmd_status(ctx: &ServerContext) -> Value {
    let uptime = ctx.server_start_time.elapsed();

    json!({
        "version": ctx.version,
        "uptime_secs": uptime.as_secs(),
        "status": "running",
    })
}

fn reply_json(conn: &Connection, value: Value) {
    reply(conn, messages::info(value.to_string().as_bytes()));
}

fn reply(conn: &Connection, frame: gamewire_proto::Result<Bytes>) {
    match frame {
        Ok(frame) => conn.send(frame),
        Err(e) => warn!("Could not build reply for {}: {}", conn.id(), e),
    }
}
