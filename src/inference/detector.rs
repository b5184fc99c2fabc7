//! Detector interface
//!
//! The detection model is an external collaborator. The pipeline only needs
//! to run it on an image and render its detections back onto that image.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::annotate::draw_detections;

/// Errors raised by a detector. The pipeline propagates them unchanged.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Failed to read detector input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse detections: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single detected object in pixel coordinates of the inferred image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding box as `[x_min, y_min, x_max, y_max]`
    pub bbox_xyxy: [f32; 4],
    pub score: f32,
    pub class_id: u32,
    #[serde(default)]
    pub label: Option<String>,
}

/// Detections for one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    pub detections: Vec<Detection>,
}

impl Detections {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// An object detector
pub trait Detector: Send {
    /// Model identity recorded in the `model` column
    fn model_name(&self) -> &str;

    /// Run detection on an image
    fn infer(&mut self, image: &DynamicImage) -> Result<Detections, DetectorError>;

    /// Annotated copy of `image` showing `detections`
    fn render(&self, image: &DynamicImage, detections: &Detections) -> DynamicImage {
        DynamicImage::ImageRgba8(draw_detections(image, detections))
    }
}
