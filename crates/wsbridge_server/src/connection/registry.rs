//! Bidirectional identifier ↔ handle registry.
//!
//! The registry is not synchronized; [`crate::server::ServerCore`]
//! keeps it behind its state lock so both directions change together.

use std::collections::HashMap;
use std::hash::Hash;
use uuid::Uuid;

/// Mapping between connection identifiers and live handles.
///
/// The two maps are always exact inverses of each other.
#[derive(Debug)]
pub struct Registry<H> {
    by_identifier: HashMap<String, H>,
    by_handle: HashMap<H, String>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            by_identifier: HashMap::new(),
            by_handle: HashMap::new(),
        }
    }
}

impl<H: Clone + Eq + Hash> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under a fresh random identifier.
    pub fn register(&mut self, handle: H) -> String {
        self.register_with(handle, || Uuid::new_v4().to_string())
    }

    /// Registers `handle` using `generate` for identifiers, retrying until it
    /// yields one that is not currently registered.
    ///
    /// Registering a handle that is already present returns its existing
    /// identifier.
    pub fn register_with<F>(&mut self, handle: H, mut generate: F) -> String
    where
        F: FnMut() -> String,
    {
        if let Some(existing) = self.by_handle.get(&handle) {
            return existing.clone();
        }

        let identifier = loop {
            let candidate = generate();
            if !self.by_identifier.contains_key(&candidate) {
                break candidate;
            }
            tracing::debug!("Identifier collision on {}, regenerating", candidate);
        };

        self.by_identifier.insert(identifier.clone(), handle.clone());
        self.by_handle.insert(handle, identifier.clone());
        identifier
    }

    pub fn lookup_handle(&self, identifier: &str) -> Option<&H> {
        self.by_identifier.get(identifier)
    }

    pub fn lookup_identifier(&self, handle: &H) -> Option<&str> {
        self.by_handle.get(handle).map(String::as_str)
    }

    /// Removes both directions for `identifier`. Removing an unknown
    /// identifier is a no-op.
    pub fn remove(&mut self, identifier: &str) -> Option<H> {
        let handle = self.by_identifier.remove(identifier)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }

    /// Snapshot of every registered handle.
    pub fn handles(&self) -> Vec<H> {
        self.by_identifier.values().cloned().collect()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.by_identifier.len() == self.by_handle.len()
            && self
                .by_identifier
                .iter()
                .all(|(id, handle)| self.by_handle.get(handle) == Some(id))
    }
}
