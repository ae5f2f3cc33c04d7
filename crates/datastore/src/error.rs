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

#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    /// The key has no persisted record. Callers that hydrate from the
    /// store treat this as "start empty", not as a failure.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The conditional write or delete lost a race: the stored version no
    /// longer matches what the caller read. This is the retry-class error;
    /// recompute against the current record and resubmit.
    #[error("stale version for key {key}: submitted {submitted}, store has {current}")]
    StaleVersion {
        key: String,
        submitted: u64,
        current: u64,
    },

    /// The persisted payload cannot be decoded.
    #[error("invalid data for key {key}: {reason}")]
    InvalidData { key: String, reason: String },

    /// The store is unreachable or failed in a way that is not a version
    /// conflict. Never retried by the allocation core.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl DataStoreError {
    /// True for failures that signal "your version is stale, recompute and
    /// resubmit" as opposed to terminal ones.
    pub fn is_retry(&self) -> bool {
        matches!(self, DataStoreError::StaleVersion { .. })
    }
}
