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

//! Run-length encoded bitmap with store-synchronized allocation.
//!
//! One [`Handle`] tracks which ordinals of an address space are free or
//! allocated. Agents on different hosts share a handle by identity: the
//! bitmap lives as a versioned record in the distributed store, every
//! mutation is a compare-and-swap against that record's version token,
//! and a lost race simply means recompute and resubmit. No distributed
//! lock is ever held during a mutation.

mod error;
mod handle;
mod sequence;

pub use error::BitSequenceError;
pub use handle::Handle;
pub use sequence::{
    BLOCK_BYTES, BLOCK_LEN, Sequence, SequenceNode, num_blocks, ordinal_to_pos, pos_to_ordinal,
};
