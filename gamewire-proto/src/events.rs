use crate::Connection;
use tokio::sync::mpsc;

/// Identity a client presents when it connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginContext {
    pub username: String,
}

/// Notifications consumed by the application around the network core
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Connected {
        connection: Connection,
        login: Option<LoginContext>,
    },
    Disconnected {
        connection: Connection,
    },
    PacketReceived {
        connection: Connection,
        id: u8,
    },
    NetworkError {
        connection: Option<Connection>,
        error: String,
    },
}

/// Fan-out point for network events; emitting never blocks the I/O tasks
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<NetworkEvent>>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that drops every event
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: NetworkEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening anymore
            let _ = tx.send(event);
        }
    }
}
