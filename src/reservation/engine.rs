//! Per-node capacity ledger and the five operations of §4.6:
//! `Reserve`/`Claim`/`Release`/`GetAvailable`/`ExpireStale`.
//!
//! Each node's ledger is guarded by its own `std::sync::Mutex`; no lock is
//! ever held across an `.await`, so a node's critical section is always a
//! short, synchronous computation and event publication happens strictly
//! after the lock is dropped (§5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::error::ReservationError;
use crate::reservation::events::{EventSink, NoopEventSink, ReservationEvent};
use crate::reservation::types::{
    expires_at, CapacityReservation, Dimensions, NodeCapacity, ReservationStatus, Token,
};

/// Default bound on `Reserve`'s `ttl` argument (§4.6 "default 15 m").
pub const DEFAULT_MAX_RESERVATION_TTL: Duration = Duration::from_secs(15 * 60);

/// Hard ceiling no engine instance may exceed regardless of configuration
/// (§4.6 "max 24 h").
pub const ABSOLUTE_MAX_RESERVATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default period between `ExpireStale` sweeps (§4.6).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct NodeLedger {
    capacity: NodeCapacity,
    claimed_in_flight: Dimensions,
    reservations: HashMap<Token, CapacityReservation>,
}

impl NodeLedger {
    fn new(capacity: NodeCapacity) -> NodeLedger {
        NodeLedger {
            capacity,
            claimed_in_flight: Dimensions::default(),
            reservations: HashMap::new(),
        }
    }

    fn active_pending(&self) -> Dimensions {
        self.reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending)
            .fold(Dimensions::default(), |acc, r| acc.saturating_add(&r.dimensions))
    }

    fn available(&self) -> Dimensions {
        self.capacity
            .total
            .saturating_sub(&self.claimed_in_flight)
            .saturating_sub(&self.active_pending())
    }
}

/// Owns every node's ledger plus the token→node index needed so `Claim` and
/// `Release` can locate a reservation's node from its token alone.
pub struct Engine {
    nodes: Mutex<HashMap<String, Arc<Mutex<NodeLedger>>>>,
    token_index: Mutex<HashMap<Token, String>>,
    max_reservation_ttl: Duration,
    sink: Arc<dyn EventSink>,
}

impl Engine {
    pub fn new(max_reservation_ttl: Option<Duration>) -> Engine {
        let ttl = max_reservation_ttl
            .unwrap_or(DEFAULT_MAX_RESERVATION_TTL)
            .min(ABSOLUTE_MAX_RESERVATION_TTL);
        Engine {
            nodes: Mutex::new(HashMap::new()),
            token_index: Mutex::new(HashMap::new()),
            max_reservation_ttl: ttl,
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_sink(max_reservation_ttl: Option<Duration>, sink: Arc<dyn EventSink>) -> Engine {
        let mut engine = Engine::new(max_reservation_ttl);
        engine.sink = sink;
        engine
    }

    /// Register (or replace) a node's total capacity. A node with no
    /// registered capacity is `NodeNotAccepting` for every other operation.
    pub fn register_node(&self, node_id: impl Into<String>, capacity: NodeCapacity) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(node_id.into(), Arc::new(Mutex::new(NodeLedger::new(capacity))));
    }

    fn ledger_for(&self, node_id: &str) -> Option<Arc<Mutex<NodeLedger>>> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }

    pub async fn reserve(
        &self,
        node_id: &str,
        dimensions: Dimensions,
        requested_by: impl Into<String>,
        ttl: Duration,
        correlation_id: Option<String>,
    ) -> Result<CapacityReservation, ReservationError> {
        if ttl.is_zero() || ttl > self.max_reservation_ttl {
            return Err(ReservationError::InvalidTtl);
        }
        let ledger = self.ledger_for(node_id).ok_or(ReservationError::NodeNotAccepting)?;

        let reservation = {
            let mut ledger = ledger.lock().unwrap();
            if !ledger.available().covers(&dimensions) {
                return Err(ReservationError::InsufficientCapacity);
            }

            let now = SystemTime::now();
            let reservation = CapacityReservation {
                token: Uuid::new_v4(),
                node_id: node_id.to_string(),
                dimensions,
                requested_by: requested_by.into(),
                correlation_id,
                status: ReservationStatus::Pending,
                created_at: now,
                expires_at: expires_at(now, ttl),
                claimed_at: None,
                released_at: None,
                claimed_server_id: None,
            };
            ledger.reservations.insert(reservation.token, reservation.clone());
            reservation
        };

        self.token_index
            .lock()
            .unwrap()
            .insert(reservation.token, node_id.to_string());

        self.sink.emit(ReservationEvent::CapacityReserved {
            token: reservation.token,
            node_id: reservation.node_id.clone(),
            dimensions: reservation.dimensions,
            timestamp: reservation.created_at,
        });

        Ok(reservation)
    }

    pub async fn claim(
        &self,
        token: Token,
        server_id: impl Into<String>,
    ) -> Result<CapacityReservation, ReservationError> {
        let node_id = self
            .token_index
            .lock()
            .unwrap()
            .get(&token)
            .cloned()
            .ok_or(ReservationError::NotFound)?;
        let ledger = self.ledger_for(&node_id).ok_or(ReservationError::NotFound)?;
        let server_id = server_id.into();

        let mut ledger = ledger.lock().unwrap();
        let now = SystemTime::now();
        let reservation = ledger
            .reservations
            .get_mut(&token)
            .ok_or(ReservationError::NotFound)?;

        if reservation.status != ReservationStatus::Pending {
            return Err(ReservationError::NotPending);
        }
        if reservation.is_expired_at(now) {
            reservation.status = ReservationStatus::Expired;
            return Err(ReservationError::Expired);
        }

        reservation.status = ReservationStatus::Claimed;
        reservation.claimed_at = Some(now);
        reservation.claimed_server_id = Some(server_id.clone());
        let dimensions = reservation.dimensions;
        let result = reservation.clone();
        ledger.claimed_in_flight = ledger.claimed_in_flight.saturating_add(&dimensions);
        drop(ledger);

        self.sink.emit(ReservationEvent::CapacityClaimed {
            token,
            node_id,
            server_id,
            timestamp: now,
        });

        Ok(result)
    }

    pub async fn release(&self, token: Token, reason: Option<String>) -> Result<(), ReservationError> {
        let node_id = self
            .token_index
            .lock()
            .unwrap()
            .get(&token)
            .cloned()
            .ok_or(ReservationError::NotFound)?;
        let ledger = self.ledger_for(&node_id).ok_or(ReservationError::NotFound)?;

        let mut ledger = ledger.lock().unwrap();
        let now = SystemTime::now();
        let reservation = ledger
            .reservations
            .get_mut(&token)
            .ok_or(ReservationError::NotFound)?;

        if reservation.status.is_terminal() {
            return Err(ReservationError::AlreadyTerminal);
        }

        if reservation.status == ReservationStatus::Claimed {
            let dimensions = reservation.dimensions;
            ledger.claimed_in_flight = ledger.claimed_in_flight.saturating_sub(&dimensions);
        }
        let reservation = ledger.reservations.get_mut(&token).unwrap();
        reservation.status = ReservationStatus::Released;
        reservation.released_at = Some(now);
        drop(ledger);

        self.sink.emit(ReservationEvent::CapacityReleased {
            token,
            node_id,
            reason,
            timestamp: now,
        });

        Ok(())
    }

    pub async fn get_available(&self, node_id: &str) -> Result<Dimensions, ReservationError> {
        let ledger = self.ledger_for(node_id).ok_or(ReservationError::NodeNotAccepting)?;
        Ok(ledger.lock().unwrap().available())
    }

    /// List every non-terminal reservation on a node (§6.4 `listActive`):
    /// `Pending` and `Claimed`, excluding `Released`/`Expired`.
    pub async fn list_active(&self, node_id: &str) -> Result<Vec<CapacityReservation>, ReservationError> {
        let ledger = self.ledger_for(node_id).ok_or(ReservationError::NodeNotAccepting)?;
        let ledger = ledger.lock().unwrap();
        Ok(ledger
            .reservations
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect())
    }

    /// Sweep every node for `Pending` reservations whose `expiresAt` has
    /// passed, transition them to `Expired`, and publish one event per
    /// expiry. Idempotent — a reservation already non-Pending is untouched.
    pub async fn expire_stale(&self) {
        let now = SystemTime::now();
        let ledgers: Vec<(String, Arc<Mutex<NodeLedger>>)> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, ledger)| (id.clone(), ledger.clone()))
            .collect();

        let mut expired = Vec::new();
        for (node_id, ledger) in ledgers {
            let mut ledger = ledger.lock().unwrap();
            for reservation in ledger.reservations.values_mut() {
                if reservation.status == ReservationStatus::Pending && reservation.is_expired_at(now) {
                    reservation.status = ReservationStatus::Expired;
                    expired.push((reservation.token, node_id.clone()));
                }
            }
        }

        for (token, node_id) in expired {
            self.sink.emit(ReservationEvent::CapacityReservationExpired {
                token,
                node_id,
                timestamp: now,
            });
        }
    }

    /// Spawn the periodic sweeper described in §4.6/§5 as its own timed
    /// task; cancelled by dropping the returned handle.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.expire_stale().await;
            }
        })
    }
}
