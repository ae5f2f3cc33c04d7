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

use std::net::Ipv4Addr;

use bitseq::BitSequenceError;
use ipnetwork::Ipv4Network;

#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("pool {0} has exhausted all address space")]
    PoolExhausted(Ipv4Network),

    #[error("address {0} is not part of pool {1}")]
    AddressOutOfPool(Ipv4Addr, Ipv4Network),

    #[error("address {0} is already allocated")]
    AddressInUse(Ipv4Addr),

    #[error("address {0} is reserved and cannot be allocated or released")]
    AddressReserved(Ipv4Addr),

    #[error("pool subnet {subnet} is not usable: {reason}")]
    InvalidPool { subnet: Ipv4Network, reason: String },

    #[error(transparent)]
    Bitmap(#[from] BitSequenceError),
}
