//! In-process key registry.
//!
//! Built once at startup and shared by handle. Sign, verify and public-key
//! lookups take the read lock; generation, rotation and deletion take the
//! write lock.

use crate::key::{KeyInfo, KeyPair};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;

/// Concurrent map of key identifier to key pair
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<String, KeyPair>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<String, KeyPair>> {
        self.keys.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, KeyPair>> {
        self.keys.write()
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.read().contains_key(key_id)
    }

    pub fn info(&self, key_id: &str) -> Option<KeyInfo> {
        self.keys.read().get(key_id).map(KeyPair::info)
    }

    /// Snapshot of every key, sorted by identifier
    pub fn infos(&self) -> Vec<KeyInfo> {
        let mut infos: Vec<KeyInfo> = self.keys.read().values().map(KeyPair::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.keys.read().values().filter(|k| k.active).count()
    }
}
