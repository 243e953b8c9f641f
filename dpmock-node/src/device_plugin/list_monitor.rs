//! Versioned list with poll-based change detection.

use std::sync::RwLock;

struct Versioned<T> {
    list: Vec<T>,
    version: u64,
}

/// A list plus a version counter bumped on every update.
///
/// Readers remember the last version they saw and take a snapshot once it
/// advances. `None` as the remembered version never matches, so a fresh
/// reader always gets one snapshot.
pub struct ListMonitor<T> {
    inner: RwLock<Versioned<T>>,
}

impl<T: Clone> Default for ListMonitor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ListMonitor<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Versioned {
                list: Vec::new(),
                version: 0,
            }),
        }
    }

    /// Replace the list. Always bumps the version, even for an equal list.
    pub fn update(&self, list: Vec<T>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.list = list;
        inner.version = inner.version.wrapping_add(1);
    }

    pub fn version(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).version
    }

    /// Snapshot of the list if its version differs from `seen`.
    pub fn changed_since(&self, seen: &mut Option<u64>) -> Option<Vec<T>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if *seen == Some(inner.version) {
            return None;
        }
        *seen = Some(inner.version);
        Some(inner.list.clone())
    }
}
