// src/selection/mod.rs
//
// From a stable track to the crop worth spending OCR on:
//   crop (padded) → sanity filter → best-crop window

pub mod best_crop;
pub mod crop;
pub mod reject_dump;
pub mod sanity;

pub use best_crop::{BestCropSelector, Candidate};
pub use crop::{crop_image, crop_rect, CropRect};
pub use reject_dump::RejectReporter;
pub use sanity::{SanityFilter, SanityInput, SanityVerdict};
