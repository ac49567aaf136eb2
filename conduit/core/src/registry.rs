//! Connection Registry
//!
//! Maps client identities to their [`ClientHandle`]s. The registry is the
//! single source of truth for which connections may receive traffic: relay
//! targets are resolved here, and a connection absent from the registry is
//! stale by definition and must not process further frames.
//!
//! Each identity has at most one occupant. Inserting over an existing
//! identity displaces the previous handle and returns it so the caller can
//! close it; this is how reconnecting clients evict their old connections.
//!
//! The registry is cheap to clone and all clones share state. Lookups clone
//! the handle out inside a short lock scope so no lock is ever held across
//! an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::ClientHandle;

/// Shared map of connected clients keyed by identity.
#[derive(Clone, Default)]
pub struct Registry {
    clients: Arc<RwLock<HashMap<u64, ClientHandle>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` under `id`, returning the displaced occupant if the
    /// identity was already taken. The caller is responsible for closing
    /// the displaced connection.
    pub fn insert(&self, id: u64, handle: ClientHandle) -> Option<ClientHandle> {
        let displaced = self.clients.write().insert(id, handle);
        if displaced.is_some() {
            tracing::debug!(id, "client registered, displacing previous connection");
        } else {
            tracing::debug!(id, "client registered");
        }
        displaced
    }

    /// Remove and return the handle registered under `id`.
    pub fn remove(&self, id: u64) -> Option<ClientHandle> {
        let removed = self.clients.write().remove(&id);
        if removed.is_some() {
            tracing::debug!(id, "client unregistered");
        }
        removed
    }

    /// Remove the entry under `id` only when it aliases `handle`.
    ///
    /// Used by connection teardown so a stale connection can never remove
    /// the entry of the connection that displaced it. The check and removal
    /// happen under one write lock.
    pub fn remove_if_same(&self, id: u64, handle: &ClientHandle) -> bool {
        let mut clients = self.clients.write();
        if clients
            .get(&id)
            .is_some_and(|current| current.same_connection(handle))
        {
            clients.remove(&id);
            tracing::debug!(id, "client unregistered");
            return true;
        }
        false
    }

    /// Look up the handle registered under `id`.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<ClientHandle> {
        self.clients.read().get(&id).cloned()
    }

    /// Whether `id` is currently registered.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.clients.read().contains_key(&id)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Snapshot of every registered handle.
    #[must_use]
    pub fn handles(&self) -> Vec<ClientHandle> {
        self.clients.read().values().cloned().collect()
    }

    /// Snapshot of every registered identity, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("clients", &self.len())
            .finish()
    }
}
