use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::BoundingBox;

/// One detector output in detector (letterboxed canvas) coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub class_index: usize,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(bbox: BoundingBox, class_index: usize, confidence: f32) -> Self {
        Self {
            bbox,
            class_index,
            confidence,
        }
    }
}

/// Knobs handed to the detector on every call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    /// Minimum class score kept by the detector.
    pub confidence: f32,
    /// IoU above which overlapping boxes of the same class are suppressed.
    pub iou: f32,
    pub max_detections: usize,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.7,
            max_detections: 300,
        }
    }
}

impl DetectParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!("confidence threshold must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.iou) {
            return Err(anyhow!("iou threshold must be within 0..=1"));
        }
        if self.max_detections == 0 {
            return Err(anyhow!("max_detections must be greater than zero"));
        }
        Ok(())
    }
}
