//! Fiber and actor addressing
//!
//! An [`Address`] names one fiber in the deployment as `(process_id,
//! fiber_id)`. An [`ActorId`] extends it with the 64-bit instance id of one
//! addressable entity inside that fiber.
//!
//! # Wire layout
//!
//! Field widths are an internal choice; the contract is lossless round-trip
//! within each field's range and a fixed total width on the wire:
//!
//! ```text
//! Address:  u32  = process_id:u16 << 16 | fiber_id:u16
//! ActorId:  (u64, u32) = (instance_id, Address::pack())   // 96 bits total
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process identifier within a deployment.
pub type ProcessId = u16;

/// Fiber identifier within a process.
pub type FiberId = u16;

/// Instance identifier of an entity inside a fiber.
pub type InstanceId = u64;

/// Location of one fiber: `(process_id, fiber_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub process_id: ProcessId,
    pub fiber_id: FiberId,
}

impl Address {
    pub const fn new(process_id: ProcessId, fiber_id: FiberId) -> Self {
        Self {
            process_id,
            fiber_id,
        }
    }

    /// Pack into the 32-bit wire form.
    pub const fn pack(self) -> u32 {
        ((self.process_id as u32) << 16) | self.fiber_id as u32
    }

    /// Unpack from the 32-bit wire form.
    pub const fn unpack(raw: u32) -> Self {
        Self {
            process_id: (raw >> 16) as u16,
            fiber_id: raw as u16,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process_id, self.fiber_id)
    }
}

/// Location of one actor: a fiber address plus the entity instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId {
    pub address: Address,
    pub instance_id: InstanceId,
}

impl ActorId {
    pub const fn new(address: Address, instance_id: InstanceId) -> Self {
        Self {
            address,
            instance_id,
        }
    }

    /// Pack into the fixed 96-bit wire pair `(instance_id, address)`.
    pub const fn pack(self) -> (u64, u32) {
        (self.instance_id, self.address.pack())
    }

    /// Unpack from the wire pair.
    pub const fn unpack(instance: u64, address: u32) -> Self {
        Self {
            address: Address::unpack(address),
            instance_id: instance,
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.instance_id)
    }
}
