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

use datastore::DataStoreError;

#[derive(Debug, thiserror::Error)]
pub enum BitSequenceError {
    /// Every addressable bit is currently allocated (or none is free
    /// within the requested range).
    #[error("no bit available")]
    NoBitAvailable,

    /// The specific bit requested with `set` is already allocated.
    #[error("bit {0} is not available")]
    BitNotAvailable(u64),

    /// The ordinal falls outside the handle's address space.
    #[error("ordinal {ordinal} out of range for a {bits} bit handle")]
    OrdinalOutOfRange { ordinal: u64, bits: u32 },

    /// The serialized form is truncated or has an impossible length.
    /// Deserialization never silently truncates or pads.
    #[error("invalid serialized bit sequence: {0}")]
    InvalidFormat(String),

    /// The handle's version token moved between snapshot and commit even
    /// though our own conditional write succeeded. This indicates a logic
    /// error, not a normal failure mode; the operation aborts without
    /// committing.
    #[error("unexpected version change: snapshot had {snapshot}, handle has {current}")]
    UnexpectedVersionChange { snapshot: u64, current: u64 },

    /// Terminal store failure (not a version conflict).
    #[error(transparent)]
    Store(#[from] DataStoreError),
}
