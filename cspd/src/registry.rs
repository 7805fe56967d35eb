//! Process-local map of live sockets.
//!
//! The registry is the only component that holds socket handles. Entries
//! exist exactly as long as the owning receive loop runs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use csp_common::{ConnectionKey, ConnectionRole};
use thiserror::Error;
use tracing::warn;

use crate::transport::{ConnectionId, FrameSink};

#[derive(Debug, Error)]
pub enum RegistryError {
    /// A socket is already registered locally for this role and key.
    #[error("{role} connection for {key} already registered locally (connection {existing})")]
    ConnectionConflict {
        role: ConnectionRole,
        key: ConnectionKey,
        existing: ConnectionId,
    },
}

/// A registered socket handle.
#[derive(Clone)]
pub struct RegisteredSocket {
    pub id: ConnectionId,
    pub sink: Arc<dyn FrameSink>,
}

type RegistryMap = HashMap<(ConnectionRole, ConnectionKey), RegisteredSocket>;

/// Thread-safe map from (role, key) to the socket serving it in this process.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<RegistryMap>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. Never replaces an existing entry.
    pub fn register(
        &self,
        role: ConnectionRole,
        key: ConnectionKey,
        socket: RegisteredSocket,
    ) -> Result<(), RegistryError> {
        let mut connections = self.write();
        if let Some(existing) = connections.get(&(role, key.clone())) {
            return Err(RegistryError::ConnectionConflict {
                role,
                key,
                existing: existing.id,
            });
        }
        connections.insert((role, key), socket);
        Ok(())
    }

    /// Remove the entry only if it still belongs to `id`.
    ///
    /// A mismatch means a newer socket owns the slot; it is left untouched.
    pub fn deregister_owned(&self, role: ConnectionRole, key: &ConnectionKey, id: ConnectionId) -> bool {
        let mut connections = self.write();
        let slot = (role, key.clone());
        match connections.get(&slot) {
            Some(existing) if existing.id == id => {
                connections.remove(&slot);
                true
            }
            Some(existing) => {
                warn!(
                    "Connection {} tried to remove {} entry for {}, but it is held by connection {}",
                    id, role, key, existing.id
                );
                false
            }
            None => false,
        }
    }

    pub fn lookup(&self, role: ConnectionRole, key: &ConnectionKey) -> Option<Arc<dyn FrameSink>> {
        self.read()
            .get(&(role, key.clone()))
            .map(|socket| Arc::clone(&socket.sink))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of every registered socket.
    pub fn sockets(&self) -> Vec<(ConnectionRole, ConnectionKey, RegisteredSocket)> {
        self.read()
            .iter()
            .map(|((role, key), socket)| (*role, key.clone(), socket.clone()))
            .collect()
    }

    // Entries are plain data; a panic elsewhere cannot leave them half-written.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryMap> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryMap> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}
