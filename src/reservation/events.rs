//! Events emitted per reservation state transition (§6.5), consumed by an
//! external deployment workflow outside this crate's scope.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::reservation::types::{Dimensions, Token};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReservationEvent {
    CapacityReserved {
        token: Token,
        node_id: String,
        dimensions: Dimensions,
        timestamp: SystemTime,
    },
    CapacityClaimed {
        token: Token,
        node_id: String,
        server_id: String,
        timestamp: SystemTime,
    },
    CapacityReleased {
        token: Token,
        node_id: String,
        reason: Option<String>,
        timestamp: SystemTime,
    },
    CapacityReservationExpired {
        token: Token,
        node_id: String,
        timestamp: SystemTime,
    },
}

/// Publication point for reservation events. Implementors must not block the
/// caller for long — events are published after the per-node critical
/// section has already been released (§5 "no operation holds a lock across
/// external I/O").
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ReservationEvent);
}

/// Default sink used when the engine is constructed without one; drops
/// every event.
#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: ReservationEvent) {}
}

/// Forwards every event onto an unbounded channel; the engine's own tests
/// and any embedding service that wants an in-process event stream use this
/// rather than reimplementing the plumbing.
pub struct ChannelEventSink {
    sender: tokio::sync::mpsc::UnboundedSender<ReservationEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (ChannelEventSink, tokio::sync::mpsc::UnboundedReceiver<ReservationEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (ChannelEventSink { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: ReservationEvent) {
        // Fire-and-forget: nobody listening anymore is not an error (§5, §9).
        let _ = self.sender.send(event);
    }
}
