// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cache of idle keep-alive streams, shared by persisting connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::transport::BoxedStream;

static GLOBAL_POOL: Lazy<Arc<ConnectionPool>> = Lazy::new(ConnectionPool::new);

/// Idle streams keyed by socket URL.
///
/// Streams are checked out while a connection uses them and handed back when
/// the connection is dropped, so two connections never share a stream.
#[derive(Default)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, BoxedStream>>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide pool used unless a connection is given its own.
    pub fn global() -> Arc<Self> {
        GLOBAL_POOL.clone()
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<String, BoxedStream>> {
        // A panic while holding the lock can't leave the map half-updated
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn take(&self, key: &str) -> Option<BoxedStream> {
        let stream = self.idle().remove(key);
        if stream.is_some() {
            debug!("Reusing persisted connection to {key}");
        }
        stream
    }

    pub(crate) fn put(&self, key: String, stream: BoxedStream) {
        debug!("Persisting connection to {key}");
        // Replacing drops, and thereby closes, an older idle stream
        self.idle().insert(key, stream);
    }

    pub(crate) fn evict(&self, key: &str) {
        if self.idle().remove(key).is_some() {
            debug!("Dropped persisted connection to {key}");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.idle().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.idle().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes all idle streams.
    pub fn clear(&self) {
        self.idle().clear();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.idle().keys().cloned().collect();
        keys.sort();
        f.debug_struct("ConnectionPool").field("idle", &keys).finish()
    }
}
