// src/analysis/mod.rs
//
// Per-frame evidence over time:
//   detections → plate_tracker (identity) → stabilizer (is it worth OCR?)

pub mod plate_tracker;
pub mod stabilizer;

pub use plate_tracker::{PlateTracker, Track};
pub use stabilizer::{build_strategy, Observation, StabilityStrategy};
