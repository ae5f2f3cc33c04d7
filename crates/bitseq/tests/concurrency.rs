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

//! Race tests: several handles share one store record, as agents on
//! different hosts would, and hammer it concurrently. Whatever the
//! interleaving, no ordinal may ever be handed out twice and the free
//! counter must balance.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bitseq::{BitSequenceError, Handle};
use datastore::{DataStore, MemoryStore};
use rand::Rng;

const APP: &str = "race";
const HANDLE_BITS: u32 = 1024;

async fn jitter() {
    let micros = rand::rng().random_range(0..200);
    tokio::time::sleep(Duration::from_micros(micros)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_set_any_never_double_allocates() {
    const WORKERS: usize = 8;
    const PER_WORKER: usize = 50;

    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
    let mut tasks = Vec::with_capacity(WORKERS);
    for worker in 0..WORKERS {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            // One handle per worker, as one agent per host would hold.
            let handle = Handle::new(APP, "subnet", HANDLE_BITS, Some(store))
                .await
                .expect("handle creation");
            let mut ordinals = Vec::with_capacity(PER_WORKER);
            for _ in 0..PER_WORKER {
                jitter().await;
                let ordinal = handle
                    .set_any()
                    .await
                    .unwrap_or_else(|e| panic!("worker {worker}: {e}"));
                ordinals.push(ordinal);
            }
            ordinals
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for ordinal in task.await.expect("worker panicked") {
            assert!(
                seen.insert(ordinal),
                "ordinal {ordinal} was allocated twice"
            );
        }
    }
    assert_eq!(seen.len(), WORKERS * PER_WORKER);

    // A fresh observer agrees on the final count.
    let observer = Handle::new(APP, "subnet", HANDLE_BITS, Some(store))
        .await
        .expect("handle creation");
    assert_eq!(
        observer.unselected() as usize,
        HANDLE_BITS as usize - WORKERS * PER_WORKER
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_exact_set_has_one_winner() {
    const CONTENDERS: usize = 6;
    const TARGET: u64 = 42;

    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
    let mut tasks = Vec::with_capacity(CONTENDERS);
    for _ in 0..CONTENDERS {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let handle = Handle::new(APP, "exact", HANDLE_BITS, Some(store))
                .await
                .expect("handle creation");
            jitter().await;
            handle.set(TARGET).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.expect("contender panicked") {
            Ok(()) => winners += 1,
            Err(BitSequenceError::BitNotAvailable(ordinal)) => assert_eq!(ordinal, TARGET),
            Err(e) => panic!("unexpected failure: {e}"),
        }
    }
    assert_eq!(winners, 1, "exactly one contender may win the bit");

    let observer = Handle::new(APP, "exact", HANDLE_BITS, Some(store))
        .await
        .expect("handle creation");
    assert!(observer.is_set(TARGET));
    assert_eq!(observer.unselected(), HANDLE_BITS - 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allocate_release_churn_balances() {
    const WORKERS: usize = 4;
    const ROUNDS: usize = 30;

    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
    let mut tasks = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let handle = Handle::new(APP, "churn", HANDLE_BITS, Some(store))
                .await
                .expect("handle creation");
            for _ in 0..ROUNDS {
                let ordinal = handle.set_any().await.expect("space available");
                jitter().await;
                handle.unset(ordinal).await.expect("release");
            }
        }));
    }
    for task in tasks {
        task.await.expect("worker panicked");
    }

    let observer = Handle::new(APP, "churn", HANDLE_BITS, Some(store))
        .await
        .expect("handle creation");
    assert_eq!(observer.unselected(), HANDLE_BITS);
}
