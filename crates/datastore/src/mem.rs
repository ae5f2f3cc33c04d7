/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

//! In-process [`DataStore`] with faithful compare-and-swap semantics.
//!
//! Backed by a HashMap under a single global lock. Version tokens come
//! from one shared counter, so a successful write always observes a token
//! strictly greater than any it could have raced with -- which is all the
//! allocation core needs to reason about lost updates.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{DataStore, DataStoreError, KvPair, WatchEvent};

/// Buffered events per watch channel before a slow receiver starts
/// lagging. Laggards are expected to re-read the key.
const WATCH_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, KvPair>,
    watchers: HashMap<String, broadcast::Sender<WatchEvent>>,
    last_version: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored. Test helper.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn current_version(&self, key: &str) -> u64 {
        self.entries.get(key).map(|pair| pair.version).unwrap_or(0)
    }

    fn notify(&mut self, key: &str, version: u64) {
        if let Some(sender) = self.watchers.get(key) {
            // Nobody listening is fine; the channel only exists for cache
            // invalidation.
            let _ = sender.send(WatchEvent {
                key: key.to_string(),
                version,
            });
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<KvPair, DataStoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| DataStoreError::KeyNotFound(key.to_string()))
    }

    async fn put_atomic(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, DataStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current_version(key);
        if current != expected_version {
            return Err(DataStoreError::StaleVersion {
                key: key.to_string(),
                submitted: expected_version,
                current,
            });
        }
        inner.last_version += 1;
        let version = inner.last_version;
        inner.entries.insert(key.to_string(), KvPair { value, version });
        inner.notify(key, version);
        Ok(version)
    }

    async fn delete_atomic(&self, key: &str, expected_version: u64) -> Result<(), DataStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current_version(key);
        if current == 0 {
            // Already gone, nothing to conflict with.
            return Ok(());
        }
        if current != expected_version {
            return Err(DataStoreError::StaleVersion {
                key: key.to_string(),
                submitted: expected_version,
                current,
            });
        }
        inner.entries.remove(key);
        inner.notify(key, 0);
        Ok(())
    }

    fn watch(&self, key: &str) -> broadcast::Receiver<WatchEvent> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .watchers
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_absent_key() {
        let store = MemoryStore::new();
        let v1 = store
            .put_atomic("k", b"a".to_vec(), 0)
            .await
            .expect("initial create should succeed");
        assert!(v1 > 0);

        // A second create against version 0 must lose.
        let err = store
            .put_atomic("k", b"b".to_vec(), 0)
            .await
            .expect_err("create over an existing key should conflict");
        assert!(err.is_retry());
    }

    #[tokio::test]
    async fn test_cas_succession() {
        let store = MemoryStore::new();
        let v1 = store.put_atomic("k", b"a".to_vec(), 0).await.unwrap();
        let v2 = store.put_atomic("k", b"b".to_vec(), v1).await.unwrap();
        assert!(v2 > v1);

        // The old token no longer wins.
        let err = store
            .put_atomic("k", b"c".to_vec(), v1)
            .await
            .expect_err("write with a superseded version should conflict");
        assert!(err.is_retry());

        let pair = store.get("k").await.unwrap();
        assert_eq!(pair.value, b"b");
        assert_eq!(pair.version, v2);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        let err = store.get("nope").await.expect_err("key should be absent");
        assert!(matches!(err, DataStoreError::KeyNotFound(_)));
        assert!(!err.is_retry());
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let store = MemoryStore::new();
        // Deleting an absent key is tolerated.
        store.delete_atomic("k", 42).await.unwrap();

        let v1 = store.put_atomic("k", b"a".to_vec(), 0).await.unwrap();
        let err = store
            .delete_atomic("k", v1 + 1)
            .await
            .expect_err("delete with wrong version should conflict");
        assert!(err.is_retry());

        store.delete_atomic("k", v1).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_watch_sees_writes() {
        let store = MemoryStore::new();
        let mut rx = store.watch("k");
        let v1 = store.put_atomic("k", b"a".to_vec(), 0).await.unwrap();

        let event = rx.recv().await.expect("watch event should arrive");
        assert_eq!(event.key, "k");
        assert_eq!(event.version, v1);

        store.delete_atomic("k", v1).await.unwrap();
        let event = rx.recv().await.expect("delete event should arrive");
        assert_eq!(event.version, 0);
    }
}
