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

//! Address pools over the shared allocation bitmap.
//!
//! An [`AddressPool`] maps one IPv4 subnet onto one [`bitseq::Handle`]:
//! "give me a free address" becomes "allocate the lowest free bit",
//! ordinals are host offsets from the network address, and agents on
//! different hosts configured with the same subnet coordinate through the
//! handle's store record without ever taking a distributed lock.

mod error;
mod pool;

pub use error::IpamError;
pub use pool::{AddressPool, PoolConfig};
