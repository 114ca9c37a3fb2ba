use anyhow::{anyhow, Result};
use image::RgbImage;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::nms::non_max_suppression;
use crate::detect::result::{DetectParams, RawDetection};
use crate::BoundingBox;

/// Stub backend for demos without a model. Uses pixel hashing: a frame whose
/// content differs from the previous one yields a single detection whose
/// class, score and box are derived from the hash.
pub struct StubBackend {
    class_names: Vec<String>,
    last_hash: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new(class_names: Vec<String>) -> Self {
        Self {
            class_names,
            last_hash: None,
        }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_names(&self) -> Option<Vec<String>> {
        Some(self.class_names.clone())
    }

    fn detect(&mut self, frame: &RgbImage, params: &DetectParams) -> Result<Vec<RawDetection>> {
        if self.class_names.is_empty() {
            return Err(anyhow!("stub backend has no classes"));
        }
        let current_hash: [u8; 32] = Sha256::digest(frame.as_raw()).into();

        let changed = match self.last_hash {
            Some(prev) => prev != current_hash,
            None => false,
        };

        self.last_hash = Some(current_hash);

        if !changed {
            return Ok(Vec::new());
        }

        let class_index = current_hash[0] as usize % self.class_names.len();
        let confidence = 0.5 + (current_hash[1] as f32 / 255.0) * 0.5;
        let side = frame.width().min(frame.height()) as f32;
        let extent = side * (0.2 + (current_hash[2] as f32 / 255.0) * 0.3);
        let cx = frame.width() as f32 / 2.0;
        let cy = frame.height() as f32 / 2.0;

        let mut dets = vec![RawDetection::new(
            BoundingBox::from_center(cx, cy, extent, extent),
            class_index,
            confidence,
        )];
        dets.retain(|d| d.confidence >= params.confidence);
        non_max_suppression(&mut dets, params.iou);
        dets.truncate(params.max_detections);
        Ok(dets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame(fill: u8) -> RgbImage {
        RgbImage::from_pixel(16, 16, Rgb([fill, fill, fill]))
    }

    #[test]
    fn stub_backend_reports_changed_frames() {
        let mut backend = StubBackend::new(vec!["Non-Violence".into(), "Violence".into()]);
        let params = DetectParams::default();

        let r1 = backend.detect(&frame(1), &params).unwrap();
        assert!(r1.is_empty());

        let r2 = backend.detect(&frame(2), &params).unwrap();
        assert_eq!(r2.len(), 1);
        assert!(r2[0].class_index < 2);
        assert!((0.5..=1.0).contains(&r2[0].confidence));

        let r3 = backend.detect(&frame(2), &params).unwrap();
        assert!(r3.is_empty());
    }
}
