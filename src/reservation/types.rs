//! Data model for the Reservation Engine (§3, §4.6): per-node capacity
//! dimensions and the reservation record itself.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, globally unique, unguessable reservation token (§4.6 "Token is
/// globally unique and unguessable").
pub type Token = Uuid;

/// The three capacity axes tracked per node. A zero value on any one axis
/// means "not requested" for that axis and always succeeds against it
/// (§4.6 `Reserve`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpu_millicores: u64,
}

impl Dimensions {
    pub fn new(memory_mb: u64, disk_mb: u64, cpu_millicores: u64) -> Dimensions {
        Dimensions {
            memory_mb,
            disk_mb,
            cpu_millicores,
        }
    }

    /// True if every axis of `self` is at least the corresponding axis of
    /// `other` — used to check `capacity - claimed - active >= requested`.
    pub fn covers(&self, other: &Dimensions) -> bool {
        self.memory_mb >= other.memory_mb
            && self.disk_mb >= other.disk_mb
            && self.cpu_millicores >= other.cpu_millicores
    }

    pub fn saturating_sub(&self, other: &Dimensions) -> Dimensions {
        Dimensions {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            cpu_millicores: self.cpu_millicores.saturating_sub(other.cpu_millicores),
        }
    }

    pub fn saturating_add(&self, other: &Dimensions) -> Dimensions {
        Dimensions {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
            cpu_millicores: self.cpu_millicores.saturating_add(other.cpu_millicores),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Claimed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Released | ReservationStatus::Expired)
    }
}

/// A single capacity hold against one node (§3 `CapacityReservation`).
/// Transitions at most once, and terminally, out of `Pending` into exactly
/// one of `Claimed`, `Released`, `Expired` — `Claimed` itself still requires
/// an eventual `Release` to free capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityReservation {
    pub token: Token,
    pub node_id: String,
    pub dimensions: Dimensions,
    pub requested_by: String,
    pub correlation_id: Option<String>,
    pub status: ReservationStatus,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub claimed_at: Option<SystemTime>,
    pub released_at: Option<SystemTime>,
    pub claimed_server_id: Option<String>,
}

impl CapacityReservation {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }
}

/// Configured total capacity for one node (§3 `NodeCapacity`). The
/// in-flight/reservation deductions live in the ledger, not here — this is
/// just the registered ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub total: Dimensions,
}

impl NodeCapacity {
    pub fn new(memory_mb: u64, disk_mb: u64, cpu_millicores: u64) -> NodeCapacity {
        NodeCapacity {
            total: Dimensions::new(memory_mb, disk_mb, cpu_millicores),
        }
    }
}

pub fn expires_at(created_at: SystemTime, ttl: Duration) -> SystemTime {
    created_at.checked_add(ttl).unwrap_or(SystemTime::UNIX_EPOCH)
}
