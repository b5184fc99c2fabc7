//! Replay detector
//!
//! Returns a fixed set of detections for every image. Lets the telemetry
//! pipeline run end to end without a model runtime on the host.

use std::fs;
use std::path::Path;

use image::DynamicImage;

use crate::inference::detector::{Detections, Detector, DetectorError};

/// Detector that replays recorded detections
#[derive(Debug, Clone)]
pub struct ReplayDetector {
    model_name: String,
    detections: Detections,
}

impl ReplayDetector {
    pub fn new(model_name: impl Into<String>, detections: Detections) -> Self {
        Self {
            model_name: model_name.into(),
            detections,
        }
    }

    /// Detector that never finds anything
    pub fn empty(model_name: impl Into<String>) -> Self {
        Self::new(model_name, Detections::default())
    }

    /// Load detections from a JSON file
    ///
    /// Accepts either `{"detections": [...]}` or a bare array of detections.
    pub fn from_file<P: AsRef<Path>>(model_name: impl Into<String>, path: P) -> Result<Self, DetectorError> {
        let json = fs::read_to_string(path.as_ref())?;
        let detections = match serde_json::from_str::<Detections>(&json) {
            Ok(d) => d,
            Err(_) => Detections {
                detections: serde_json::from_str(&json)?,
            },
        };
        tracing::debug!(
            "Loaded {} replay detection(s) from {}",
            detections.len(),
            path.as_ref().display()
        );
        Ok(Self::new(model_name, detections))
    }
}

impl Detector for ReplayDetector {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn infer(&mut self, _image: &DynamicImage) -> Result<Detections, DetectorError> {
        Ok(self.detections.clone())
    }
}
