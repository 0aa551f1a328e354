//! Capacity Reservation Engine (§4.6): an independent, in-process allocator
//! consumed by an external deployment workflow (§1 Non-goals — this crate
//! only implements the allocator itself, not the service that fronts it).

pub mod engine;
pub mod events;
pub mod types;

pub use engine::{
    Engine, ABSOLUTE_MAX_RESERVATION_TTL, DEFAULT_MAX_RESERVATION_TTL, DEFAULT_SWEEP_INTERVAL,
};
pub use events::{ChannelEventSink, EventSink, NoopEventSink, ReservationEvent};
pub use types::{CapacityReservation, Dimensions, NodeCapacity, ReservationStatus, Token};

/// Referenced by [`crate::error::ReservationError::InvalidTtl`]'s message;
/// the default policy bound (§4.6 "default 15 m"), not a hard engine-wide
/// constant — an `Engine` may be constructed with a tighter or (up to the
/// absolute 24 h ceiling) looser bound via [`Engine::new`].
pub use engine::DEFAULT_MAX_RESERVATION_TTL as MAX_RESERVATION_TTL;
