use anyhow::Result;
use image::RgbImage;

use super::result::{DetectParams, RawDetection};

/// Detector backend trait.
///
/// The backend is opaque to the pipeline: it receives the letterboxed
/// `T x T` frame and returns boxes in that frame's coordinates. Mapping back
/// to the source frame, labelling and alerting happen outside the backend.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class names carried by the model, indexed by class index.
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }

    /// Run detection on one letterboxed frame.
    ///
    /// Implementations honour `params.confidence`, `params.iou` and
    /// `params.max_detections`.
    fn detect(&mut self, frame: &RgbImage, params: &DetectParams) -> Result<Vec<RawDetection>>;

    /// Run one black frame through the backend so the first real frame does
    /// not pay initialisation cost.
    fn warm_up(&mut self, target: u32) -> Result<()> {
        let frame = RgbImage::new(target, target);
        self.detect(&frame, &DetectParams::default())?;
        Ok(())
    }
}
