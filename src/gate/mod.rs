// src/gate/mod.rs

pub mod engine;
pub mod events;
pub mod plate;
pub mod whitelist;

pub use engine::{GateEngine, PlateReading};
pub use events::{Event, EventLevel, EventStatus, EventStore, SharedEventStore};
