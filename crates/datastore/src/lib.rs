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

//! Versioned key-value store interface consumed by the fabric allocation
//! core.
//!
//! The distributed store itself (etcd, consul, ...) lives behind the
//! [`DataStore`] trait; the allocator only relies on three things:
//!
//!   - reads return an opaque, monotonically increasing version token
//!     alongside the value,
//!   - writes and deletes are conditional on that token (compare-and-swap),
//!     failing with a distinguishable retry-class error when the record
//!     moved under the caller,
//!   - external changes to a key can be observed through a watch channel.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and
//! single-node deployments.

use async_trait::async_trait;
use tokio::sync::broadcast;

mod error;
mod mem;

pub use error::DataStoreError;
pub use mem::MemoryStore;

/// Root of the key namespace shared by every fabric component.
pub const KEY_PREFIX: &str = "fabric";

/// A value read from the store together with the version token it was
/// stored under. Version `0` is reserved for "the key does not exist" and
/// is never returned by a successful read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Notification of an external change to a watched key. `version` is the
/// token of the write that triggered the event, or `0` for a deletion.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub version: u64,
}

/// Derive the store key for an object identified by `(app, id)`. Every
/// process computing the same pair addresses the same persisted record.
pub fn object_key(app: &str, id: &str) -> String {
    format!("{KEY_PREFIX}/{app}/{id}")
}

/// The versioned store contract.
///
/// Implementations must guarantee that at most one of any set of
/// concurrent `put_atomic` calls carrying the same `expected_version`
/// succeeds; everything the allocator promises about double allocation
/// rests on that.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Read the current value and version of `key`.
    async fn get(&self, key: &str) -> Result<KvPair, DataStoreError>;

    /// Conditionally write `value` under `key`. `expected_version == 0`
    /// means "create; the key must not exist yet". Returns the new version
    /// token on success, [`DataStoreError::StaleVersion`] when the stored
    /// version no longer matches.
    async fn put_atomic(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, DataStoreError>;

    /// Conditionally delete `key`. Deleting an absent key succeeds.
    async fn delete_atomic(&self, key: &str, expected_version: u64) -> Result<(), DataStoreError>;

    /// Subscribe to changes of `key`. Events are delivered on a best-effort
    /// basis; a lagging receiver may miss intermediate versions and should
    /// re-read the key instead of trusting the event payload.
    fn watch(&self, key: &str) -> broadcast::Receiver<WatchEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("ipam", "10.1.0.0/16"), "fabric/ipam/10.1.0.0/16");
    }
}
