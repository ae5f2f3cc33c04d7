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

//! Run-length encoded bitmap.
//!
//! The bitmap is a run of 32-bit blocks; a node `(block, count)` stands
//! for `count` consecutive repetitions of the same block value. Long runs
//! of all-free or all-allocated address space therefore encode in eight
//! bytes, which is what keeps multi-million-bit subnets cheap to ship
//! through the store on every allocation.
//!
//! Bit 0 of a block is the most significant bit: ordinal `k` lives at
//! byte `k / 8`, bit `k % 8`, and the in-block selector starts at
//! `1 << 31` and shifts right.
//!
//! The original design used an owned forward-linked chain; here the nodes
//! sit in a `Vec` with index-based splits and merges, preserving the exact
//! split/merge semantics including the forward-only merge (see
//! [`Sequence::merge_from`]).

use crate::error::BitSequenceError;

/// Selector for bit 0 of a block.
const BLOCK_FIRST_BIT: u32 = 1 << 31;
/// A block with no free bit.
const BLOCK_FULL: u32 = u32::MAX;
/// Bits covered by one block.
pub const BLOCK_LEN: u32 = 32;
/// Bytes covered by one block.
pub const BLOCK_BYTES: u64 = 4;
/// Serialized size of one node: block and count, both big-endian u32.
const NODE_WIRE_LEN: usize = 8;

/// Number of blocks needed to cover `bits` bit positions. The last block
/// may cover more bits than requested; those trailing positions are never
/// addressed by valid ordinals and are tolerated, not corrected.
pub fn num_blocks(bits: u32) -> u32 {
    bits.div_ceil(BLOCK_LEN)
}

/// `count` consecutive repetitions of the same 32-bit block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNode {
    pub block: u32,
    pub count: u32,
}

impl SequenceNode {
    /// Position of the first 0-bit of this node's block, scanning from the
    /// most significant bit, as `(byte, bit)` relative to the start of the
    /// block: byte in `0..=3`, bit in `0..=7`. None when the block has no
    /// free bit or the node is logically absent (`count == 0`).
    pub fn first_free_bit(&self) -> Option<(u64, u64)> {
        if self.block == BLOCK_FULL || self.count == 0 {
            return None;
        }
        let pos = self.block.leading_ones() as u64;
        Some((pos / 8, pos % 8))
    }
}

/// The run-length encoded chain. Owned exclusively by one [`Handle`];
/// nothing else mutates it.
///
/// [`Handle`]: crate::Handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    nodes: Vec<SequenceNode>,
}

impl Sequence {
    /// An all-free sequence of `blocks` blocks.
    pub fn new(blocks: u32) -> Self {
        Sequence {
            nodes: vec![SequenceNode {
                block: 0,
                count: blocks,
            }],
        }
    }

    pub fn from_nodes(nodes: Vec<SequenceNode>) -> Self {
        Sequence { nodes }
    }

    pub fn nodes(&self) -> &[SequenceNode] {
        &self.nodes
    }

    /// Locate the node covering the byte at `byte_pos`. Returns the node
    /// index, the number of whole blocks preceding the target byte within
    /// that node, and the byte offset of the target within its block
    /// (`0..=3`). None when `byte_pos` is beyond the chain.
    fn find_node(&self, byte_pos: u64) -> Option<(usize, u32, u64)> {
        let mut node_start = 0u64;
        for (index, node) in self.nodes.iter().enumerate() {
            let node_len = u64::from(node.count) * BLOCK_BYTES;
            if byte_pos < node_start + node_len {
                let offset = byte_pos - node_start;
                let prec_blocks = (offset / BLOCK_BYTES) as u32;
                let in_block_byte_pos = offset % BLOCK_BYTES;
                return Some((index, prec_blocks, in_block_byte_pos));
            }
            node_start += node_len;
        }
        None
    }

    /// First free bit of the whole chain as an absolute `(byte, bit)`
    /// position. Fully allocated nodes are skipped wholesale; their byte
    /// length offsets the result.
    pub fn first_available(&self) -> Option<(u64, u64)> {
        let mut byte_offset = 0u64;
        for node in &self.nodes {
            if let Some((byte, bit)) = node.first_free_bit() {
                return Some((byte_offset + byte, bit));
            }
            byte_offset += u64::from(node.count) * BLOCK_BYTES;
        }
        None
    }

    /// First free bit with ordinal in `start..=end`, as an absolute
    /// `(byte, bit)` position. Works block-wise: within a node every block
    /// repeats the same value, so only the range-edge blocks and one
    /// interior representative need testing.
    pub fn first_available_in_range(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        if start > end {
            return None;
        }
        let start_block = start / u64::from(BLOCK_LEN);
        let end_block = end / u64::from(BLOCK_LEN);

        let mut node_first_block = 0u64;
        for node in &self.nodes {
            let node_last_block = node_first_block + u64::from(node.count);
            let lo = node_first_block.max(start_block);
            let hi = (node_last_block.saturating_sub(1)).min(end_block);
            if node.count > 0 && node.block != BLOCK_FULL && lo <= hi {
                if let Some(ordinal) =
                    first_free_in_blocks(node.block, lo, hi, start_block, end_block, start, end)
                {
                    return Some((ordinal / 8, ordinal % 8));
                }
            }
            node_first_block = node_last_block;
            if node_first_block > end_block {
                break;
            }
        }
        None
    }

    /// Exact-bit availability test for `ordinal`. Returns the bit's
    /// `(byte, bit)` position only if that specific bit is currently 0;
    /// None when it is set or when the ordinal falls beyond the chain's
    /// encoded length.
    pub fn check_available(&self, ordinal: u64) -> Option<(u64, u64)> {
        let (byte_pos, bit_pos) = ordinal_to_pos(ordinal);
        let (index, _, in_block_byte_pos) = self.find_node(byte_pos)?;
        let bit_sel = BLOCK_FIRST_BIT >> (in_block_byte_pos * 8 + bit_pos);
        if self.nodes[index].block & bit_sel == 0 {
            Some((byte_pos, bit_pos))
        } else {
            None
        }
    }

    /// Set (`release == false`) or clear (`release == true`) the bit at
    /// `(byte_pos, bit_pos)`, splitting and re-merging nodes as needed.
    /// Returns whether the chain changed: a request whose bit already has
    /// the target value is a no-op, as is a position beyond the chain.
    pub fn push_reservation(&mut self, byte_pos: u64, bit_pos: u64, release: bool) -> bool {
        let Some((index, prec_blocks, in_block_byte_pos)) = self.find_node(byte_pos) else {
            return false;
        };

        let bit_sel = BLOCK_FIRST_BIT >> (in_block_byte_pos * 8 + bit_pos);
        let old_block = self.nodes[index].block;
        let new_block = if release {
            old_block & !bit_sel
        } else {
            old_block | bit_sel
        };

        // Redundant request: the bit already holds the target value.
        if new_block == old_block {
            return false;
        }

        // The owning node inevitably loses one block to the new
        // single-block node.
        self.nodes[index].count -= 1;
        let new_node = SequenceNode {
            block: new_block,
            count: 1,
        };

        if prec_blocks == 0 {
            // Target was the first block of the node: splice the new node
            // in front, dropping the owner outright if it is now empty.
            if self.nodes[index].count == 0 {
                self.nodes[index] = new_node;
            } else {
                self.nodes.insert(index, new_node);
            }
            self.merge_from(index.saturating_sub(1));
        } else if prec_blocks == self.nodes[index].count {
            // Target was the last block: splice the new node right after
            // the shrunk owner and merge starting from the owner.
            self.nodes.insert(index + 1, new_node);
            self.merge_from(index);
        } else {
            // Interior block: split into pre / new / post. Neither side of
            // the new node can match its distinct value, so no merge.
            let post_count = self.nodes[index].count - prec_blocks;
            self.nodes[index].count = prec_blocks;
            self.nodes.insert(index + 1, new_node);
            self.nodes.insert(
                index + 2,
                SequenceNode {
                    block: old_block,
                    count: post_count,
                },
            );
        }
        true
    }

    /// Coalesce runs of adjacent equal-block nodes, scanning forward from
    /// `start` to the end of the chain. Positions before `start` are never
    /// re-examined, so a merge opportunity strictly to the left of the
    /// starting point is not retried.
    fn merge_from(&mut self, start: usize) {
        let mut index = start;
        while index < self.nodes.len() {
            while index + 1 < self.nodes.len()
                && self.nodes[index].block == self.nodes[index + 1].block
            {
                self.nodes[index].count += self.nodes[index + 1].count;
                self.nodes.remove(index + 1);
            }
            index += 1;
        }
    }

    /// Serialize the chain: 8 bytes big-endian per node, in order.
    pub fn to_byte_array(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nodes.len() * NODE_WIRE_LEN);
        for node in &self.nodes {
            out.extend_from_slice(&node.block.to_be_bytes());
            out.extend_from_slice(&node.count.to_be_bytes());
        }
        out
    }

    /// Reconstruct a chain from its serialized form. The length must be a
    /// non-zero multiple of 8.
    pub fn from_byte_array(data: &[u8]) -> Result<Self, BitSequenceError> {
        if data.is_empty() || data.len() % NODE_WIRE_LEN != 0 {
            return Err(BitSequenceError::InvalidFormat(format!(
                "sequence length {} is not a non-zero multiple of {}",
                data.len(),
                NODE_WIRE_LEN
            )));
        }
        let nodes = data
            .chunks_exact(NODE_WIRE_LEN)
            .map(|chunk| SequenceNode {
                block: u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                count: u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            })
            .collect();
        Ok(Sequence { nodes })
    }
}

/// Convert a bit ordinal to its `(byte, bit)` position.
pub fn ordinal_to_pos(ordinal: u64) -> (u64, u64) {
    (ordinal / 8, ordinal % 8)
}

/// Convert a `(byte, bit)` position back to a bit ordinal.
pub fn pos_to_ordinal(byte_pos: u64, bit_pos: u64) -> u64 {
    byte_pos * 8 + bit_pos
}

/// First free ordinal within blocks `lo..=hi`, all holding `block`,
/// constrained to ordinals `start..=end`. `start_block` / `end_block` mark
/// which blocks are range edges and need a partial mask; if a full-mask
/// interior block has no free bit, none of its siblings has either, so the
/// scan jumps straight to the end edge.
fn first_free_in_blocks(
    block: u32,
    lo: u64,
    hi: u64,
    start_block: u64,
    end_block: u64,
    start: u64,
    end: u64,
) -> Option<u64> {
    let mut k = lo;
    while k <= hi {
        let mut mask = u32::MAX;
        if k == start_block {
            mask &= u32::MAX >> (start % u64::from(BLOCK_LEN));
        }
        if k == end_block {
            mask &= u32::MAX << (u64::from(BLOCK_LEN) - 1 - end % u64::from(BLOCK_LEN));
        }
        let free = !block & mask;
        if free != 0 {
            return Some(k * u64::from(BLOCK_LEN) + u64::from(free.leading_zeros()));
        }
        if k != start_block && k != end_block {
            // Interior blocks all share this mask; only the end edge can
            // still differ.
            if end_block > k && end_block <= hi {
                k = end_block;
                continue;
            }
            return None;
        }
        k += 1;
    }
    None
}
