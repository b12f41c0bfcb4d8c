use crate::registry::is_reserved;
use crate::{
    crypto, Encryptor, EventSender, FrameAssembler, HandlerRegistry, LoginContext, NetworkEvent,
    ProcessedPacket, ProtocolError, Result, CLIENT_GOODBYE, DEFAULT_MAX_PACKET_LENGTH,
    DEFAULT_RECEIVE_BUFFER_SIZE, SERVER_GOODBYE,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which end of the socket this connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Goodbye id this side writes before closing
    pub fn goodbye(self) -> u8 {
        match self {
            Role::Client => CLIENT_GOODBYE,
            Role::Server => SERVER_GOODBYE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Scratch buffer size, the most one socket read can return
    pub receive_buffer_size: usize,
    /// Largest frame length accepted from the peer
    pub max_packet_length: usize,
    pub write_timeout: Duration,
    pub connect_timeout: Duration,
    pub linger: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            max_packet_length: DEFAULT_MAX_PACKET_LENGTH,
            write_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            linger: Some(Duration::from_secs(5)),
        }
    }
}

type CloseHook = Box<dyn FnOnce(&Connection) + Send + 'static>;

/// Handles to the I/O tasks of a live socket
struct Link {
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    /// Interrupts in-flight writes, skipping the flush and goodbye
    force: CancellationToken,
    closed: CancellationToken,
}

struct Inner {
    id: String,
    role: Role,
    registry: Arc<HandlerRegistry>,
    encryptor: Arc<dyn Encryptor>,
    config: ConnectionConfig,
    events: EventSender,
    link: Mutex<Option<Link>>,
    pending: Mutex<VecDeque<ProcessedPacket>>,
    dispatch: Mutex<()>,
    close_hook: Mutex<Option<CloseHook>>,
}

/// One peer socket plus its framing state and pending-dispatch queue.
///
/// Cloning is cheap; every clone refers to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("remote", &self.remote_addr())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub fn new(
        role: Role,
        registry: Arc<HandlerRegistry>,
        encryptor: Arc<dyn Encryptor>,
        config: ConnectionConfig,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: crypto::generate_nonce(),
                role,
                registry,
                encryptor,
                config,
                events,
                link: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                dispatch: Mutex::new(()),
                close_hook: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link)
            .as_ref()
            .is_some_and(|link| !link.cancel.is_cancelled())
    }

    /// Remote endpoint, or None when no socket is attached
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.link).as_ref().map(|link| link.remote)
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr().map(|addr| addr.ip())
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_addr().map(|addr| addr.port())
    }

    /// Number of packets waiting for `process_packets`
    pub fn pending_packets(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Installs a callback run once when the socket has been released
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        *lock(&self.inner.close_hook) = Some(Box::new(hook));
    }

    /// Opens an outbound connection and starts its I/O tasks.
    ///
    /// Failures are reported through the event channel as well as returned.
    pub async fn connect(&self, addr: &str, login: Option<LoginContext>) -> Result<()> {
        if lock(&self.inner.link).is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        debug!("Connection {} connecting to {}", self.inner.id, addr);

        let connecting = TcpStream::connect(addr);
        let stream = match timeout(self.inner.config.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", addr, e);
                self.report_error(&e);
                return Err(e.into());
            }
            Err(_) => {
                error!("Timed out connecting to {}", addr);
                let e = ProtocolError::ConnectTimeout(addr.to_string());
                self.report_error(&e);
                return Err(e);
            }
        };

        if let Err(e) = self.attach_tcp(stream) {
            self.report_error(&e);
            return Err(e);
        }

        info!("Connected to {} (conn: {})", addr, self.inner.id);
        self.inner.events.emit(NetworkEvent::Connected {
            connection: self.clone(),
            login,
        });

        Ok(())
    }

    /// Applies socket options to an established TCP stream and attaches it
    pub fn attach_tcp(&self, stream: TcpStream) -> Result<()> {
        let remote = stream.peer_addr()?;
        #[allow(deprecated)]
        stream.set_linger(self.inner.config.linger)?;
        stream.set_nodelay(true)?;
        self.attach(stream, remote)
    }

    /// Starts the read and write loops over any byte stream
    pub fn attach<S>(&self, stream: S, remote: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut link = lock(&self.inner.link);
        if link.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let closed = CancellationToken::new();

        *link = Some(Link {
            remote,
            outbound: outbound_tx,
            cancel: cancel.clone(),
            force: force.clone(),
            closed: closed.clone(),
        });
        drop(link);

        debug!("Connection {} attached to {}", self.inner.id, remote);

        tokio::spawn(read_loop(self.clone(), reader, cancel.clone()));
        tokio::spawn(write_loop(
            self.clone(),
            writer,
            outbound_rx,
            cancel,
            force,
            closed,
        ));

        Ok(())
    }

    /// Queues a finished frame for writing. A failed write disconnects.
    pub fn send(&self, frame: Bytes) {
        let queued = match lock(&self.inner.link).as_ref() {
            Some(link) if !link.cancel.is_cancelled() => link.outbound.send(frame).is_ok(),
            _ => {
                debug!(
                    "Connection {} not connected, dropping {} byte frame",
                    self.inner.id,
                    frame.len()
                );
                return;
            }
        };

        if !queued {
            self.disconnect();
        }
    }

    /// Encrypts `payload` into a self-describing frame and queues it
    pub fn send_encrypted(&self, packet_id: u8, payload: &[u8]) {
        if !self.is_connected() {
            return;
        }

        match self.inner.encryptor.finalize(packet_id, payload) {
            Ok(frame) => self.send(frame),
            Err(e) => {
                warn!(
                    "Connection {} failed to encrypt packet {}: {}",
                    self.inner.id, packet_id, e
                );
                self.report_error(&e);
                self.disconnect();
            }
        }
    }

    /// Requests a graceful close. Safe to call any number of times.
    pub fn disconnect(&self) {
        if let Some(link) = lock(&self.inner.link).as_ref() {
            if !link.cancel.is_cancelled() {
                info!("Disconnecting {} ({})", self.inner.id, link.remote);
                link.cancel.cancel();
            }
        }
    }

    /// Closes at once, abandoning queued frames and any write in progress.
    ///
    /// Used when a peer stops reading and a graceful close would stall.
    pub fn abort(&self) {
        if let Some(link) = lock(&self.inner.link).as_ref() {
            if !link.force.is_cancelled() {
                warn!("Aborting connection {} ({})", self.inner.id, link.remote);
                link.cancel.cancel();
                link.force.cancel();
            }
        }
    }

    /// Resolves once the socket is released and the close notifications have fired
    pub async fn closed(&self) {
        let closed = lock(&self.inner.link).as_ref().map(|link| link.closed.clone());
        if let Some(closed) = closed {
            closed.cancelled().await;
        }
    }

    /// Runs the registered callback for every packet queued as of this call, in arrival order.
    ///
    /// Returns 0 without dispatching if another call is already running,
    /// including a nested call from inside a callback.
    pub fn process_packets(&self) -> usize {
        let _dispatching = match self.inner.dispatch.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("Connection {} already dispatching", self.inner.id);
                return 0;
            }
        };

        let batch: Vec<ProcessedPacket> = lock(&self.inner.pending).drain(..).collect();
        let mut dispatched = 0;

        for packet in batch {
            match self.inner.registry.lookup(packet.id) {
                Some(entry) => {
                    (entry.callback)(self, &packet);
                    dispatched += 1;
                }
                None => warn!("No handler for packet {} at dispatch, skipping", packet.id),
            }
        }

        dispatched
    }

    fn enqueue(&self, packets: impl Iterator<Item = ProcessedPacket>) {
        let mut ids = Vec::new();
        {
            let mut pending = lock(&self.inner.pending);
            for packet in packets {
                ids.push(packet.id);
                pending.push_back(packet);
            }
        }

        for id in ids {
            self.inner.events.emit(NetworkEvent::PacketReceived {
                connection: self.clone(),
                id,
            });
        }
    }

    fn report_error(&self, error: &dyn fmt::Display) {
        self.inner.events.emit(NetworkEvent::NetworkError {
            connection: Some(self.clone()),
            error: error.to_string(),
        });
    }

    fn finish_close(&self, closed: &CancellationToken) {
        let remote = lock(&self.inner.link).take().map(|link| link.remote);

        let hook = lock(&self.inner.close_hook).take();
        if let Some(hook) = hook {
            hook(self);
        }

        info!("Connection {} closed (remote: {:?})", self.inner.id, remote);
        self.inner.events.emit(NetworkEvent::Disconnected {
            connection: self.clone(),
        });

        closed.cancel();
    }
}

async fn read_loop<R>(conn: Connection, mut reader: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut scratch = vec![0u8; conn.inner.config.receive_buffer_size];
    let mut assembler = FrameAssembler::new(conn.inner.config.max_packet_length);
    let mut packets = Vec::new();

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut scratch) => match read {
                Ok(0) => {
                    debug!("Peer closed connection {}", conn.inner.id);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Read error on connection {}: {}", conn.inner.id, e);
                    conn.report_error(&e);
                    break;
                }
            },
        };

        let result = assembler.feed(
            &scratch[..n],
            &conn.inner.registry,
            conn.inner.encryptor.as_ref(),
            &mut packets,
        );

        if let Some(at) = packets.iter().position(|p| is_reserved(p.id)) {
            let goodbye = packets[at].id;
            packets.truncate(at);
            conn.enqueue(packets.drain(..));
            info!("Received goodbye {} on connection {}", goodbye, conn.inner.id);
            break;
        }

        conn.enqueue(packets.drain(..));

        if let Err(e) = result {
            warn!("Protocol error on connection {}: {}", conn.inner.id, e);
            conn.report_error(&e);
            break;
        }
    }

    conn.disconnect();
}

async fn write_loop<W>(
    conn: Connection,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    force: CancellationToken,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let limit = conn.inner.config.write_timeout;
    let mut healthy = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame, limit, &force).await {
                        if !force.is_cancelled() {
                            warn!("Write error on connection {}: {}", conn.inner.id, e);
                            conn.report_error(&e);
                        }
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if healthy && !force.is_cancelled() {
        // Flush what was queued before the disconnect, then say goodbye
        outbound.close();
        while let Ok(frame) = outbound.try_recv() {
            if write_frame(&mut writer, &frame, limit, &force).await.is_err() {
                healthy = false;
                break;
            }
        }

        if healthy {
            let goodbye = [conn.inner.role.goodbye()];
            if let Err(e) = write_frame(&mut writer, &goodbye, limit, &force).await {
                debug!("Goodbye not delivered on connection {}: {}", conn.inner.id, e);
            }
        }
    }

    tokio::select! {
        biased;
        _ = force.cancelled() => {}
        _ = timeout(limit, writer.shutdown()) => {}
    }
    drop(writer);

    cancel.cancel();
    conn.finish_close(&closed);
}

async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    limit: Duration,
    force: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = timeout(limit, async {
        writer.write_all(frame).await?;
        writer.flush().await
    });

    tokio::select! {
        biased;
        _ = force.cancelled() => Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "connection aborted",
        ))),
        written = write => {
            written.map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timeout",
                ))
            })??;
            Ok(())
        }
    }
}
