// src/network/ippool.rs
//
// =============================================================================
// SANDCELL: IP POOL (v 0.4)
// =============================================================================
//
// Per-network address inventory.
//
// Responsibilities:
// 1. CIDR parsing and validation (prefix 8..=30 for bridge networks).
// 2. Hand out host addresses, skipping network, broadcast, and gateway.
// 3. Reclaim addresses; releasing an address that was never handed out is
//    an error (catches double-release bugs upstream).
// 4. Overlap checks against other networks and the reserved blocklist.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::EngineError;

// ============================================================================
// 1. CIDR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrV4 {
    pub base: Ipv4Addr,
    pub prefix: u8,
}

/// Ranges no job network may touch: loopback, link-local, multicast, and
/// the limited-broadcast address.
const BLOCKLIST: &[(&str, u8)] = &[
    ("127.0.0.0", 8),
    ("169.254.0.0", 16),
    ("224.0.0.0", 4),
    ("255.255.255.255", 32),
];

impl CidrV4 {
    /// Parses "10.10.0.0/24". The base is normalized to the network address.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let (addr, prefix) = raw
            .trim()
            .split_once('/')
            .ok_or_else(|| EngineError::Validation(format!("CIDR '{}' missing prefix", raw)))?;

        let base: Ipv4Addr = addr
            .parse()
            .map_err(|_| EngineError::Validation(format!("bad address in CIDR '{}'", raw)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| EngineError::Validation(format!("bad prefix in CIDR '{}'", raw)))?;

        if prefix < 8 || prefix > 30 {
            return Err(EngineError::Validation(format!(
                "CIDR prefix /{} out of range (8..=30)",
                prefix
            )));
        }

        let mask = u32::MAX << (32 - prefix);
        let network = u32::from(base) & mask;
        Ok(Self {
            base: Ipv4Addr::from(network),
            prefix,
        })
    }

    pub fn network_u32(&self) -> u32 {
        u32::from(self.base)
    }

    pub fn broadcast_u32(&self) -> u32 {
        self.network_u32() | (u32::MAX >> self.prefix)
    }

    /// First usable host address; by convention the bridge gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network_u32() + 1)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix);
        (u32::from(ip) & mask) == self.network_u32()
    }

    pub fn overlaps(&self, other: &CidrV4) -> bool {
        let shorter = self.prefix.min(other.prefix);
        let mask = u32::MAX << (32 - shorter);
        (self.network_u32() & mask) == (other.network_u32() & mask)
    }

    /// Rejects CIDRs covering loopback, link-local, or multicast space.
    pub fn check_blocklist(&self) -> Result<(), EngineError> {
        for (base, prefix) in BLOCKLIST {
            let blocked = CidrV4 {
                base: base.parse().expect("static blocklist entry"),
                prefix: *prefix,
            };
            if self.overlaps(&blocked) {
                return Err(EngineError::Validation(format!(
                    "CIDR {} overlaps reserved range {}/{}",
                    self, base, prefix
                )));
            }
        }
        Ok(())
    }

    /// Usable host addresses: everything except network and broadcast.
    pub fn capacity(&self) -> usize {
        let total = 1u64 << (32 - self.prefix);
        (total.saturating_sub(2)) as usize
    }
}

impl std::fmt::Display for CidrV4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

// ============================================================================
// 2. THE POOL
// ============================================================================

/// Allocated-address set inside one CIDR. Lives behind the owning network's
/// lock; the scan is linear over the host range, which is fine for the /16
/// and smaller networks this engine serves.
#[derive(Debug)]
pub struct IpPool {
    cidr: CidrV4,
    allocated: BTreeSet<u32>,
}

impl IpPool {
    pub fn new(cidr: CidrV4) -> Self {
        Self {
            cidr,
            allocated: BTreeSet::new(),
        }
    }

    pub fn cidr(&self) -> CidrV4 {
        self.cidr
    }

    /// Lowest free host address. Network and broadcast are never returned;
    /// every other host address is allocatable.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, EngineError> {
        let net = self.cidr.network_u32();
        let bcast = self.cidr.broadcast_u32();

        for candidate in (net + 1)..bcast {
            if self.allocated.contains(&candidate) {
                continue;
            }
            self.allocated.insert(candidate);
            return Ok(Ipv4Addr::from(candidate));
        }

        Err(EngineError::Quota(format!(
            "no free address in {} ({} allocated)",
            self.cidr,
            self.allocated.len()
        )))
    }

    /// Returns an address to the pool. Fails on addresses outside the CIDR
    /// or never allocated.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), EngineError> {
        if !self.cidr.contains(ip) {
            return Err(EngineError::Internal(format!(
                "release of {} outside {}",
                ip, self.cidr
            )));
        }
        if !self.allocated.remove(&u32::from(ip)) {
            return Err(EngineError::Internal(format!(
                "release of unallocated address {}",
                ip
            )));
        }
        Ok(())
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}
