use gamewire_proto::{
    CipherSuite, Connection, ConnectionConfig, EventSender, HandlerRegistry, NetworkEvent, Role,
};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub backlog: u32,
    pub max_conns: usize,
    /// Upper bound on how long shutdown waits for connections to close
    pub drain_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: 10_000,
            max_conns: 1000,
            drain_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

type ConnectionSet = RwLock<HashMap<SocketAddr, Connection>>;

struct ListenerInner {
    registry: Arc<HandlerRegistry>,
    cipher: CipherSuite,
    psk: Vec<u8>,
    config: ListenerConfig,
    events: EventSender,
    /// Live connections keyed by remote endpoint
    connections: Arc<ConnectionSet>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    accepting: AtomicBool,
    shutting_down: AtomicBool,
}

/// Owns the passive socket and the set of live server-side connections
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        cipher: CipherSuite,
        psk: Vec<u8>,
        config: ListenerConfig,
        events: EventSender,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_conns));

        Self {
            inner: Arc::new(ListenerInner {
                registry,
                cipher,
                psk,
                config,
                events,
                connections: Arc::new(RwLock::new(HashMap::new())),
                slots,
                shutdown: CancellationToken::new(),
                stopped: CancellationToken::new(),
                accepting: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Binds and accepts until `shutdown` is called
    pub async fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let listener = self.listen(addr)?;
        self.run(listener).await;
        Ok(())
    }

    /// Creates the passive socket with the configured backlog
    pub fn listen(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.inner.config.backlog)?;

        info!(
            "Listening on {} (backlog: {}, max connections: {})",
            listener.local_addr()?,
            self.inner.config.backlog,
            self.inner.config.max_conns
        );

        Ok(listener)
    }

    /// Accept loop; the passive socket is closed when this returns
    pub async fn run(&self, listener: TcpListener) {
        self.inner.accepting.store(true, Ordering::SeqCst);
        let shutdown = self.inner.shutdown.clone();

        loop {
            // Acquire connection slot
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.inner.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, remote) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            self.admit(stream, remote, permit);
        }

        drop(listener);
        info!("Passive socket closed");
        self.inner.stopped.cancel();
    }

    fn admit(&self, stream: TcpStream, remote: SocketAddr, permit: OwnedSemaphorePermit) {
        if self.inner.shutdown.is_cancelled() {
            debug!("Refusing connection from {} during shutdown", remote);
            return;
        }

        let encryptor = match self.inner.cipher.build(&self.inner.psk) {
            Ok(encryptor) => encryptor,
            Err(e) => {
                error!(
                    "Cannot build {} encryptor for {}: {}",
                    self.inner.cipher.name(),
                    remote,
                    e
                );
                return;
            }
        };

        let conn = Connection::new(
            Role::Server,
            self.inner.registry.clone(),
            encryptor,
            self.inner.config.connection.clone(),
            self.inner.events.clone(),
        );

        let connections = Arc::downgrade(&self.inner.connections);
        conn.on_close(move |closed| {
            if let Some(connections) = connections.upgrade() {
                remove_if_same(&connections, remote, closed);
            }
            drop(permit);
        });

        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote, conn.clone());

        if let Err(e) = conn.attach_tcp(stream) {
            warn!("Failed to set up connection from {}: {}", remote, e);
            remove_if_same(&self.inner.connections, remote, &conn);
            return;
        }

        info!("Accepted connection {} from {}", conn.id(), remote);
        self.inner.events.emit(NetworkEvent::Connected {
            connection: conn,
            login: None,
        });
    }

    /// Finds the live connection for a remote endpoint
    pub fn find_connection(&self, ip: IpAddr, port: u16) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&SocketAddr::new(ip, port))
            .cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops accepting, disconnects every client and waits up to the drain
    /// timeout, then aborts whatever is still open. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Listener shutdown already in progress");
            return;
        }

        info!("Shutting down listener");
        self.inner.shutdown.cancel();

        // No admission can race the snapshot once the accept loop has stopped
        if self.inner.accepting.load(Ordering::SeqCst) {
            self.inner.stopped.cancelled().await;
        }

        let live = self.connections();
        for conn in &live {
            conn.disconnect();
        }

        let drain = async {
            for conn in &live {
                conn.closed().await;
            }
        };

        if timeout(self.inner.config.drain_timeout, drain).await.is_err() {
            let stalled: Vec<&Connection> =
                live.iter().filter(|c| c.remote_addr().is_some()).collect();
            warn!(
                "{} connections did not drain within {:?}, aborting them",
                stalled.len(),
                self.inner.config.drain_timeout
            );

            for conn in &stalled {
                conn.abort();
            }
            for conn in &stalled {
                conn.closed().await;
            }
        }

        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!("Listener shut down ({} connections released)", live.len());
    }
}

/// Removes `conn` unless its slot has already been taken by a newer connection
fn remove_if_same(connections: &ConnectionSet, remote: SocketAddr, conn: &Connection) {
    let mut set = connections.write().unwrap_or_else(PoisonError::into_inner);
    if set.get(&remote).is_some_and(|c| c.id() == conn.id()) {
        set.remove(&remote);
        debug!("Removed connection {} ({})", conn.id(), remote);
    }
}
