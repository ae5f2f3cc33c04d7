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

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bitseq::{BitSequenceError, Handle};
use datastore::DataStore;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::IpamError;

/// Namespace under which every pool persists its bitmap; the pool's
/// subnet in CIDR form is the identity within it, so every agent
/// configured with the same subnet shares one record.
const POOL_APP: &str = "ipam";

/// Declarative description of one address pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// The subnet this pool hands addresses out of.
    pub subnet: Ipv4Network,

    /// Gateway address, reserved and never allocated to a consumer.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,

    /// Address ranges inside the subnet that must never be allocated
    /// (infrastructure, static assignments, ...).
    #[serde(default)]
    pub exclusions: Vec<Ipv4Network>,
}

/// One subnet mapped onto one shared allocation bitmap.
///
/// Address ordinals are host offsets from the subnet's network address;
/// everything else -- who wins a contended address, persistence, retry on
/// version conflicts -- is the bitmap handle's business.
pub struct AddressPool {
    subnet: Ipv4Network,
    reserved: BTreeSet<u64>,
    handle: Handle,
}

impl AddressPool {
    /// Build the pool and pre-reserve its infrastructure addresses: the
    /// network and broadcast addresses (for subnets of /30 and larger),
    /// the gateway, and every configured exclusion. Reservations already
    /// present in the shared record are tolerated; peers configured with
    /// the same pool race to the same result.
    pub async fn new(
        config: PoolConfig,
        store: Option<Arc<dyn DataStore>>,
    ) -> Result<Self, IpamError> {
        let subnet = config.subnet;
        let size = 1u64 << (32 - subnet.prefix());
        let Ok(num_elements) = u32::try_from(size) else {
            return Err(IpamError::InvalidPool {
                subnet,
                reason: "subnet is larger than the addressable bitmap".to_string(),
            });
        };

        let mut reserved = BTreeSet::new();
        if subnet.prefix() < 31 {
            // Network and broadcast addresses are not assignable.
            reserved.insert(0);
            reserved.insert(size - 1);
        }
        if let Some(gateway) = config.gateway
            && subnet.contains(gateway)
        {
            reserved.insert(ordinal_in(subnet, gateway));
        }
        for exclusion in &config.exclusions {
            for addr in exclusion.iter().filter(|addr| subnet.contains(*addr)) {
                reserved.insert(ordinal_in(subnet, addr));
            }
        }

        let handle = Handle::new(POOL_APP, &subnet.to_string(), num_elements, store).await?;
        for &ordinal in &reserved {
            match handle.set(ordinal).await {
                // A peer beat us to the reservation; same outcome.
                Ok(()) | Err(BitSequenceError::BitNotAvailable(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(
            subnet = %subnet,
            reserved = reserved.len(),
            free = handle.unselected(),
            "address pool ready"
        );

        Ok(AddressPool {
            subnet,
            reserved,
            handle,
        })
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// Number of addresses currently assignable.
    pub fn num_free(&self) -> u32 {
        self.handle.unselected()
    }

    /// Allocate an address: the requested one, or the lowest free one.
    pub async fn request_address(
        &self,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, IpamError> {
        match requested {
            Some(addr) => {
                let ordinal = self.ordinal_of(addr)?;
                if self.reserved.contains(&ordinal) {
                    return Err(IpamError::AddressReserved(addr));
                }
                match self.handle.set(ordinal).await {
                    Ok(()) => Ok(addr),
                    Err(BitSequenceError::BitNotAvailable(_)) => {
                        Err(IpamError::AddressInUse(addr))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            None => match self.handle.set_any().await {
                Ok(ordinal) => {
                    let addr = self.address_of(ordinal);
                    tracing::debug!(subnet = %self.subnet, address = %addr, "allocated address");
                    Ok(addr)
                }
                Err(BitSequenceError::NoBitAvailable) => {
                    Err(IpamError::PoolExhausted(self.subnet))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Return an address to the pool. Releasing an address that was never
    /// allocated is a no-op; releasing a reserved one is refused.
    pub async fn release_address(&self, addr: Ipv4Addr) -> Result<(), IpamError> {
        let ordinal = self.ordinal_of(addr)?;
        if self.reserved.contains(&ordinal) {
            return Err(IpamError::AddressReserved(addr));
        }
        self.handle.unset(ordinal).await?;
        tracing::debug!(subnet = %self.subnet, address = %addr, "released address");
        Ok(())
    }

    /// Whether the address is currently allocated (reservations count).
    /// Addresses outside the pool report false.
    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        match self.ordinal_of(addr) {
            Ok(ordinal) => self.handle.is_set(ordinal),
            Err(_) => false,
        }
    }

    /// Remove the pool's persisted bitmap from the store.
    pub async fn destroy(&self) -> Result<(), IpamError> {
        self.handle.destroy().await?;
        Ok(())
    }

    fn ordinal_of(&self, addr: Ipv4Addr) -> Result<u64, IpamError> {
        if !self.subnet.contains(addr) {
            return Err(IpamError::AddressOutOfPool(addr, self.subnet));
        }
        Ok(ordinal_in(self.subnet, addr))
    }

    fn address_of(&self, ordinal: u64) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + ordinal as u32)
    }
}

fn ordinal_in(subnet: Ipv4Network, addr: Ipv4Addr) -> u64 {
    u64::from(u32::from(addr) - u32::from(subnet.network()))
}
