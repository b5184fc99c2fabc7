//! infer-telemetry library
//!
//! Adaptive detection pipeline that sizes each input to the available
//! accelerator memory and records per-request performance telemetry.

pub mod imaging;
pub mod inference;
pub mod pipeline;
pub mod storage;
pub mod system;
pub mod types;

pub use pipeline::{DetectionOutput, DetectionPipeline, PipelineError};

/// Round `value` to `places` decimal places, halves away from zero.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
