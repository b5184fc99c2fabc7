//! Object detection
//!
//! The detector interface, detection rendering and the timing wrapper that
//! measures each detector call.

pub mod annotate;
pub mod detector;
pub mod replay;
pub mod timing;

// Re-export main types for convenience
pub use detector::{Detection, Detections, Detector, DetectorError};
pub use replay::ReplayDetector;
pub use timing::{run_timed, Timed};
