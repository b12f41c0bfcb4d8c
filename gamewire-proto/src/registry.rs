use crate::{Connection, ProcessedPacket, ProtocolError, Result, CLIENT_GOODBYE, SERVER_GOODBYE};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Application callback invoked from `Connection::process_packets`
pub type PacketCallback = Arc<dyn Fn(&Connection, &ProcessedPacket) + Send + Sync + 'static>;

/// Returns true for ids the application may never register
pub fn is_reserved(id: u8) -> bool {
    id == CLIENT_GOODBYE || id == SERVER_GOODBYE
}

/// Framing metadata and callback for one packet type
#[derive(Clone)]
pub struct HandlerEntry {
    pub id: u8,
    pub encrypted: bool,
    /// Whole frame length including the id byte; 0 means the length travels in the header
    pub fixed_length: u16,
    pub callback: PacketCallback,
}

impl HandlerEntry {
    pub fn is_variable_length(&self) -> bool {
        self.fixed_length == 0
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("encrypted", &self.encrypted)
            .field("fixed_length", &self.fixed_length)
            .finish_non_exhaustive()
    }
}

/// Table from packet id to handler, filled at startup and shared by every connection
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u8, HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Fails for reserved ids and for ids that already have one.
    pub fn register<F>(&self, id: u8, encrypted: bool, fixed_length: u16, callback: F) -> Result<()>
    where
        F: Fn(&Connection, &ProcessedPacket) + Send + Sync + 'static,
    {
        if is_reserved(id) {
            return Err(ProtocolError::ReservedId(id));
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        if handlers.contains_key(&id) {
            return Err(ProtocolError::DuplicateHandler(id));
        }

        handlers.insert(
            id,
            HandlerEntry {
                id,
                encrypted,
                fixed_length,
                callback: Arc::new(callback),
            },
        );

        debug!(
            "Registered handler for packet {} (encrypted: {}, fixed length: {})",
            id, encrypted, fixed_length
        );

        Ok(())
    }

    pub fn lookup(&self, id: u8) -> Option<HandlerEntry> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn noop(_: &Connection, _: &ProcessedPacket) {}

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register(10, false, 5, noop).unwrap();

        let entry = registry.lookup(10).unwrap();
        assert_eq!(entry.id, 10);
        assert!(!entry.encrypted);
        assert_eq!(entry.fixed_length, 5);
        assert!(!entry.is_variable_length());
    }

    #[test]
    fn test_lookup_missing() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup(42).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reserved_ids_rejected() {
        let registry = HandlerRegistry::new();

        for id in [254u8, 255] {
            let result = registry.register(id, false, 1, noop);
            assert!(matches!(result, Err(ProtocolError::ReservedId(rejected)) if rejected == id));
        }

        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = HandlerRegistry::new();
        registry.register(7, false, 0, noop).unwrap();

        let result = registry.register(7, true, 3, noop);
        assert!(matches!(result, Err(ProtocolError::DuplicateHandler(7))));

        // Original entry is untouched
        let entry = registry.lookup(7).unwrap();
        assert!(!entry.encrypted);
        assert!(entry.is_variable_length());
    }

    #[test]
    fn test_concurrent_reads_and_writes() {
        let registry = Arc::new(HandlerRegistry::new());

        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for id in (i * 16)..(i * 16 + 16) {
                        registry.register(id, false, 0, noop).unwrap();
                        assert!(registry.lookup(id).is_some());
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(registry.len(), 128);
    }
}
