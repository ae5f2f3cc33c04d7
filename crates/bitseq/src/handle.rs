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

//! The store-synchronized bitmap handle.
//!
//! A [`Handle`] ties a [`Sequence`] to an `(app, id)` identity and drives
//! the optimistic-concurrency protocol for allocating and freeing single
//! bits. Every process computing the same identity addresses the same
//! persisted record; who actually gets a contended bit is decided by the
//! store's compare-and-swap on the version token, never by the in-memory
//! lock, which only serializes the local read/decide phase.
//!
//! Locking discipline: `state` is guarded by a plain mutex that is never
//! held across the store round-trip, so local readers stay unblocked
//! during network I/O. `write_serial` serializes local mutators for the
//! full snapshot/write/commit cycle; without it two local tasks could
//! both write successfully and then trip the commit-time version check
//! against each other.

use std::fmt;
use std::sync::{Arc, Mutex};

use datastore::{DataStore, DataStoreError};

use crate::error::BitSequenceError;
use crate::sequence::{Sequence, num_blocks, ordinal_to_pos, pos_to_ordinal};

/// Fixed prefix of the persisted record: `bits` and `unselected`, both
/// big-endian u32, followed by the serialized sequence.
const HEADER_WIRE_LEN: usize = 8;
/// Serialized size of one sequence node.
const NODE_WIRE_LEN: usize = 8;

/// A synchronized bitmap bound to one `(app, id)` identity.
pub struct Handle {
    app: String,
    id: String,
    key: String,
    store: Option<Arc<dyn DataStore>>,
    state: Mutex<HandleState>,
    write_serial: tokio::sync::Mutex<()>,
}

/// The fields the in-memory lock guards; cloned wholesale to form the
/// private copy each mutation works on.
#[derive(Clone)]
struct HandleState {
    bits: u32,
    unselected: u32,
    head: Sequence,
    db_index: u64,
    db_exists: bool,
}

/// What a mutation attempt is after.
#[derive(Clone, Copy)]
enum BitRequest {
    /// Any free bit with ordinal in `start..=end`.
    Any { start: u64, end: u64 },
    /// This specific free bit.
    Exact { ordinal: u64 },
    /// Free this bit; no availability check, redundant requests no-op.
    Release { ordinal: u64 },
}

impl Handle {
    /// Create a handle over an address space of `num_elements` bits, all
    /// free. When a store is given, a record persisted by a prior
    /// incarnation wins over the freshly initialized bitmap; an absent key
    /// means start empty.
    pub async fn new(
        app: &str,
        id: &str,
        num_elements: u32,
        store: Option<Arc<dyn DataStore>>,
    ) -> Result<Self, BitSequenceError> {
        let handle = Handle {
            key: datastore::object_key(app, id),
            app: app.to_string(),
            id: id.to_string(),
            store,
            state: Mutex::new(HandleState {
                bits: num_elements,
                unselected: num_elements,
                head: Sequence::new(num_blocks(num_elements)),
                db_index: 0,
                db_exists: false,
            }),
            write_serial: tokio::sync::Mutex::new(()),
        };
        handle.refresh_from_store().await?;
        Ok(handle)
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The store key this handle persists under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Logical size of the address space.
    pub fn bits(&self) -> u32 {
        self.state.lock().unwrap().bits
    }

    /// Number of currently free bits.
    pub fn unselected(&self) -> u32 {
        self.state.lock().unwrap().unselected
    }

    /// Allocate the first free bit and return its ordinal.
    pub async fn set_any(&self) -> Result<u64, BitSequenceError> {
        // Cheap exhaustion check before entering the retry loop; the scan
        // inside the loop would catch it too.
        let end = {
            let state = self.state.lock().unwrap();
            if state.unselected == 0 {
                return Err(BitSequenceError::NoBitAvailable);
            }
            u64::from(state.bits) - 1
        };
        self.apply(BitRequest::Any { start: 0, end }).await
    }

    /// Allocate the first free bit with ordinal in `start..=end`.
    pub async fn set_any_in_range(&self, start: u64, end: u64) -> Result<u64, BitSequenceError> {
        let bits = {
            let state = self.state.lock().unwrap();
            if state.unselected == 0 {
                return Err(BitSequenceError::NoBitAvailable);
            }
            state.bits
        };
        if start > end || end >= u64::from(bits) {
            return Err(BitSequenceError::OrdinalOutOfRange { ordinal: end, bits });
        }
        self.apply(BitRequest::Any { start, end }).await
    }

    /// Allocate the specific bit at `ordinal`. Fails when out of range or
    /// already set.
    pub async fn set(&self, ordinal: u64) -> Result<(), BitSequenceError> {
        self.validate_ordinal(ordinal)?;
        self.apply(BitRequest::Exact { ordinal }).await?;
        Ok(())
    }

    /// Free the bit at `ordinal`. Fails only when out of range; freeing an
    /// already-free bit is a no-op.
    pub async fn unset(&self, ordinal: u64) -> Result<(), BitSequenceError> {
        self.validate_ordinal(ordinal)?;
        self.apply(BitRequest::Release { ordinal }).await?;
        Ok(())
    }

    /// Whether the bit at `ordinal` is currently allocated. Out-of-range
    /// ordinals fail validation silently and report false; callers cannot
    /// distinguish "definitely free" from "invalid ordinal" here.
    pub fn is_set(&self, ordinal: u64) -> bool {
        let state = self.state.lock().unwrap();
        if ordinal > u64::from(state.bits) {
            return false;
        }
        state.head.check_available(ordinal).is_none()
    }

    /// The persisted record layout: `bits`, `unselected`, then the
    /// serialized sequence.
    pub fn to_byte_array(&self) -> Vec<u8> {
        encode_record(&self.state.lock().unwrap())
    }

    /// Replace this handle's bitmap with a previously serialized one.
    pub fn from_byte_array(&self, data: &[u8]) -> Result<(), BitSequenceError> {
        let (bits, unselected, head) = decode_record(data)?;
        let mut state = self.state.lock().unwrap();
        state.bits = bits;
        state.unselected = unselected;
        state.head = head;
        Ok(())
    }

    /// Remove the persisted record. The in-memory handle stays usable and
    /// is simply dropped by its owner.
    pub async fn destroy(&self) -> Result<(), BitSequenceError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _serial = self.write_serial.lock().await;
        loop {
            let (version, exists) = {
                let state = self.state.lock().unwrap();
                (state.db_index, state.db_exists)
            };
            if !exists {
                return Ok(());
            }
            match store.delete_atomic(&self.key, version).await {
                Ok(()) => {
                    let mut state = self.state.lock().unwrap();
                    state.db_exists = false;
                    state.db_index = 0;
                    return Ok(());
                }
                Err(e) if e.is_retry() => {
                    tracing::debug!(key = %self.key, "delete raced with a concurrent writer, refreshing");
                    if !self.refresh_from_store().await? {
                        // A peer already removed the record.
                        let mut state = self.state.lock().unwrap();
                        state.db_exists = false;
                        state.db_index = 0;
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn validate_ordinal(&self, ordinal: u64) -> Result<(), BitSequenceError> {
        let bits = self.state.lock().unwrap().bits;
        // The tolerant upper bound accepts ordinal == bits, one past the
        // last valid slot; existing callers depend on it.
        if ordinal > u64::from(bits) {
            return Err(BitSequenceError::OrdinalOutOfRange { ordinal, bits });
        }
        Ok(())
    }

    /// The allocation protocol: refresh from the store, decide under the
    /// lock, mutate a private copy with the lock released, persist it
    /// conditionally, and commit it back only while the version token
    /// still matches the snapshot. A stale-version write means another
    /// local or remote actor won the race; recompute and go again.
    async fn apply(&self, request: BitRequest) -> Result<u64, BitSequenceError> {
        let _serial = self.write_serial.lock().await;
        loop {
            self.refresh_from_store().await?;

            let (mut snapshot, snapshot_version, byte_pos, bit_pos) = {
                let state = self.state.lock().unwrap();
                let (byte_pos, bit_pos) = match request {
                    BitRequest::Any { start, end } => state
                        .head
                        .first_available_in_range(start, end)
                        .ok_or(BitSequenceError::NoBitAvailable)?,
                    BitRequest::Exact { ordinal } => state
                        .head
                        .check_available(ordinal)
                        .ok_or(BitSequenceError::BitNotAvailable(ordinal))?,
                    BitRequest::Release { ordinal } => ordinal_to_pos(ordinal),
                };
                (state.clone(), state.db_index, byte_pos, bit_pos)
            };
            let release = matches!(request, BitRequest::Release { .. });
            let ordinal = pos_to_ordinal(byte_pos, bit_pos);

            // Mutate the private copy; the live handle stays unlocked for
            // the duration of the store round-trip.
            if !snapshot.head.push_reservation(byte_pos, bit_pos, release) {
                // The bit already had the target value: nothing to
                // persist, nothing to commit, the counter is untouched.
                return Ok(ordinal);
            }
            if release {
                snapshot.unselected += 1;
            } else {
                snapshot.unselected -= 1;
            }

            match self.write_snapshot(&mut snapshot).await {
                Ok(()) => {}
                Err(e) if e.is_retry() => {
                    tracing::debug!(
                        key = %self.key,
                        ordinal,
                        "bit reservation lost the version race, recomputing"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "bit reservation failed to persist");
                    return Err(e.into());
                }
            }

            let mut state = self.state.lock().unwrap();
            if state.db_index != snapshot_version {
                // Our conditional write succeeded against a version nobody
                // else should have been able to move. Abort without
                // committing; this is a logic error, not contention.
                return Err(BitSequenceError::UnexpectedVersionChange {
                    snapshot: snapshot_version,
                    current: state.db_index,
                });
            }
            *state = snapshot;
            return Ok(ordinal);
        }
    }

    /// Hydrate the in-memory state from the persisted record. Returns
    /// whether a record was found; an absent key leaves the state as-is.
    async fn refresh_from_store(&self) -> Result<bool, BitSequenceError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let pair = match store.get(&self.key).await {
            Ok(pair) => pair,
            Err(DataStoreError::KeyNotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let (bits, unselected, head) = decode_record(&pair.value)?;
        let mut state = self.state.lock().unwrap();
        state.bits = bits;
        state.unselected = unselected;
        state.head = head;
        state.db_index = pair.version;
        state.db_exists = true;
        Ok(true)
    }

    /// Conditionally persist the private copy and stamp it with the new
    /// version token. A handle without a store persists nothing.
    async fn write_snapshot(&self, snapshot: &mut HandleState) -> Result<(), DataStoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let expected = if snapshot.db_exists {
            snapshot.db_index
        } else {
            0
        };
        let version = store
            .put_atomic(&self.key, encode_record(snapshot), expected)
            .await?;
        snapshot.db_index = version;
        snapshot.db_exists = true;
        Ok(())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Handle")
            .field("app", &self.app)
            .field("id", &self.id)
            .field("bits", &state.bits)
            .field("unselected", &state.unselected)
            .field("head", &state.head)
            .field("db_index", &state.db_index)
            .finish()
    }
}

fn encode_record(state: &HandleState) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_WIRE_LEN + state.head.nodes().len() * NODE_WIRE_LEN);
    out.extend_from_slice(&state.bits.to_be_bytes());
    out.extend_from_slice(&state.unselected.to_be_bytes());
    out.extend(state.head.to_byte_array());
    out
}

fn decode_record(data: &[u8]) -> Result<(u32, u32, Sequence), BitSequenceError> {
    if data.len() < HEADER_WIRE_LEN + NODE_WIRE_LEN {
        return Err(BitSequenceError::InvalidFormat(format!(
            "record length {} shorter than a header and one node",
            data.len()
        )));
    }
    let bits = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let unselected = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let head = Sequence::from_byte_array(&data[HEADER_WIRE_LEN..])?;
    Ok((bits, unselected, head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceNode;
    use datastore::MemoryStore;

    async fn local_handle(bits: u32) -> Handle {
        Handle::new("test", "local", bits, None)
            .await
            .expect("storeless handle creation cannot fail")
    }

    #[tokio::test]
    async fn test_new_handle_starts_all_free() {
        let handle = local_handle(1000).await;
        assert_eq!(handle.bits(), 1000);
        assert_eq!(handle.unselected(), 1000);
        assert!(!handle.is_set(0));
        assert!(!handle.is_set(999));
    }

    #[tokio::test]
    async fn test_set_unset_conservation() {
        let handle = local_handle(64).await;

        handle.set(5).await.expect("bit 5 should be free");
        assert!(handle.is_set(5));
        assert_eq!(handle.unselected(), 63);

        // Allocating an allocated bit fails and changes nothing.
        let err = handle.set(5).await.expect_err("bit 5 is taken");
        assert!(matches!(err, BitSequenceError::BitNotAvailable(5)));
        assert_eq!(handle.unselected(), 63);

        handle.unset(5).await.expect("release should succeed");
        assert!(!handle.is_set(5));
        assert_eq!(handle.unselected(), 64);

        // Releasing an already-free bit is a tolerated no-op; the counter
        // must not drift.
        handle.unset(5).await.expect("redundant release is a no-op");
        assert_eq!(handle.unselected(), 64);
    }

    #[tokio::test]
    async fn test_no_double_allocation() {
        let handle = local_handle(32).await;
        let first = handle.set_any().await.expect("space available");
        assert_eq!(first, 0);
        let second = handle.set_any().await.expect("space available");
        assert_eq!(second, 1);
        handle.unset(0).await.expect("release");
        // The freed ordinal becomes the first available again.
        assert_eq!(handle.set_any().await.expect("space available"), 0);
    }

    #[tokio::test]
    async fn test_set_any_skips_seeded_allocations() {
        // Seed the handle so the first free bit sits at ordinal
        // 32 * 100 + 31.
        let handle = local_handle(1024 * 32).await;
        let seeded = encode_record(&HandleState {
            bits: 1024 * 32,
            unselected: 1024 * 32 - 3231,
            head: Sequence::from_nodes(vec![
                SequenceNode {
                    block: u32::MAX,
                    count: 100,
                },
                SequenceNode {
                    block: 0xFFFFFFFE,
                    count: 1,
                },
                SequenceNode { block: 0, count: 923 },
            ]),
            db_index: 0,
            db_exists: false,
        });
        handle.from_byte_array(&seeded).expect("seed should decode");

        let expected = 32 * 100 + 31;
        assert!(!handle.is_set(expected));
        let ordinal = handle.set_any().await.expect("space available");
        assert_eq!(ordinal, expected);
        assert!(handle.is_set(expected));
    }

    #[tokio::test]
    async fn test_trailing_block_slack_is_never_allocated() {
        // 8 bits are backed by one 32-bit block; the 24 trailing positions
        // must never be handed out.
        let handle = local_handle(8).await;
        for expected in 0..8 {
            let ordinal = handle.set_any().await.expect("space available");
            assert_eq!(ordinal, expected);
        }
        let err = handle.set_any().await.expect_err("space exhausted");
        assert!(matches!(err, BitSequenceError::NoBitAvailable));
        assert_eq!(handle.unselected(), 0);
    }

    #[tokio::test]
    async fn test_set_any_in_range() {
        let handle = local_handle(256).await;
        let ordinal = handle
            .set_any_in_range(100, 200)
            .await
            .expect("range has space");
        assert_eq!(ordinal, 100);

        // An exhausted window reports no bit even though the rest of the
        // handle is free.
        handle.set(101).await.expect("bit 101 free");
        let err = handle
            .set_any_in_range(100, 101)
            .await
            .expect_err("window is full");
        assert!(matches!(err, BitSequenceError::NoBitAvailable));

        let err = handle
            .set_any_in_range(0, 256)
            .await
            .expect_err("end is out of range");
        assert!(matches!(err, BitSequenceError::OrdinalOutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_ordinal_validation() {
        let handle = local_handle(64).await;
        let err = handle.set(65).await.expect_err("past the tolerant bound");
        assert!(matches!(
            err,
            BitSequenceError::OrdinalOutOfRange { ordinal: 65, bits: 64 }
        ));

        // The tolerant upper bound: ordinal == bits passes validation.
        // For a block-aligned handle it denotes a position beyond the
        // encoded chain, so releasing it is a no-op.
        handle.unset(64).await.expect("tolerated boundary ordinal");
        assert_eq!(handle.unselected(), 64);

        // Out of range reads report false, silently.
        assert!(!handle.is_set(1000));
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let handle = local_handle(128).await;
        handle.set(0).await.unwrap();
        handle.set(64).await.unwrap();
        let bytes = handle.to_byte_array();

        let other = local_handle(128).await;
        other.from_byte_array(&bytes).expect("record should decode");
        assert_eq!(other.bits(), 128);
        assert_eq!(other.unselected(), 126);
        assert!(other.is_set(0));
        assert!(other.is_set(64));
        assert!(!other.is_set(1));
        assert_eq!(other.to_byte_array(), bytes);
    }

    #[tokio::test]
    async fn test_malformed_records_are_rejected() {
        let handle = local_handle(32).await;
        for len in [0usize, 7, 8, 15, 17] {
            let err = handle
                .from_byte_array(&vec![0u8; len])
                .expect_err("malformed record should be rejected");
            assert!(matches!(err, BitSequenceError::InvalidFormat(_)), "len {len}");
        }
    }

    #[tokio::test]
    async fn test_store_hydration() {
        let store = Arc::new(MemoryStore::new());
        let handle = Handle::new("test", "shared", 1024, Some(store.clone()))
            .await
            .expect("creation against an empty store");
        let ordinal = handle.set_any().await.expect("space available");

        // A second incarnation of the same identity sees the allocation.
        let revived = Handle::new("test", "shared", 1024, Some(store.clone()))
            .await
            .expect("hydration from the persisted record");
        assert!(revived.is_set(ordinal));
        assert_eq!(revived.unselected(), 1023);

        // A different identity starts empty.
        let other = Handle::new("test", "other", 1024, Some(store))
            .await
            .expect("creation against an empty key");
        assert_eq!(other.unselected(), 1024);
    }

    #[tokio::test]
    async fn test_destroy_removes_record() {
        let store = Arc::new(MemoryStore::new());
        let handle = Handle::new("test", "doomed", 64, Some(store.clone()))
            .await
            .expect("creation");
        handle.set_any().await.expect("space available");
        assert_eq!(store.len(), 1);

        handle.destroy().await.expect("destroy");
        assert!(store.is_empty());

        // Destroying again is a no-op.
        handle.destroy().await.expect("destroy is idempotent");

        // A new incarnation starts from scratch.
        let reborn = Handle::new("test", "doomed", 64, Some(store))
            .await
            .expect("creation after destroy");
        assert_eq!(reborn.unselected(), 64);
    }

    #[tokio::test]
    async fn test_stale_handle_refreshes_before_deciding() {
        let store = Arc::new(MemoryStore::new());
        let first = Handle::new("test", "contended", 64, Some(store.clone()))
            .await
            .expect("creation");
        let second = Handle::new("test", "contended", 64, Some(store))
            .await
            .expect("creation");

        // `second` is now stale, but its next mutation re-reads the record
        // and must not hand out the same ordinal.
        let a = first.set_any().await.expect("space available");
        let b = second.set_any().await.expect("space available");
        assert_ne!(a, b);
        assert_eq!(second.unselected(), 62);
    }
}
