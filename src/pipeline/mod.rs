// src/pipeline/mod.rs
//
// Task layout:
//   StreamReader ──watch──→ DetectionLoop ──CandidateQueue──→ PlateSender ──→ GateEngine
//                                ↑                                 │
//                                └──────────── feedback (mpsc) ────┘
//   StatusReporter reads liveness, overlay, metrics and the event store.

pub mod candidate_queue;
pub mod detection_loop;
pub mod metrics;
pub mod rate_gate;
pub mod sender;
pub mod status;

pub use candidate_queue::CandidateQueue;
pub use detection_loop::{DetectionLoop, Feedback, OverlayBox};
pub use metrics::PipelineMetrics;
pub use sender::PlateSender;
pub use status::StatusReporter;
