use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::nms::non_max_suppression;
use crate::detect::result::{DetectParams, RawDetection};

enum Step {
    Emit(Vec<RawDetection>),
    Fail(String),
}

/// Deterministic backend replaying a script of per-frame outputs.
///
/// Each call consumes one scripted step; once the script runs out the fixed
/// output (empty by default) is returned for every frame. Outputs still go
/// through the confidence filter, NMS and `max_detections` like a real model.
pub struct ScriptedBackend {
    class_names: Vec<String>,
    script: VecDeque<Step>,
    fixed: Vec<RawDetection>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(class_names: Vec<String>) -> Self {
        Self {
            class_names,
            script: VecDeque::new(),
            fixed: Vec::new(),
            calls: 0,
        }
    }

    /// Output returned once the script is exhausted.
    pub fn with_fixed(mut self, dets: Vec<RawDetection>) -> Self {
        self.fixed = dets;
        self
    }

    pub fn then_emit(mut self, dets: Vec<RawDetection>) -> Self {
        self.script.push_back(Step::Emit(dets));
        self
    }

    pub fn then_fail(mut self, message: &str) -> Self {
        self.script.push_back(Step::Fail(message.to_string()));
        self
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn class_names(&self) -> Option<Vec<String>> {
        Some(self.class_names.clone())
    }

    fn detect(&mut self, frame: &RgbImage, params: &DetectParams) -> Result<Vec<RawDetection>> {
        self.calls += 1;
        if frame.width() == 0 || frame.height() == 0 {
            return Err(anyhow!("scripted backend received an empty frame"));
        }

        let mut dets = match self.script.pop_front() {
            Some(Step::Emit(dets)) => dets,
            Some(Step::Fail(message)) => return Err(anyhow!(message)),
            None => self.fixed.clone(),
        };
        dets.retain(|d| d.confidence >= params.confidence);
        non_max_suppression(&mut dets, params.iou);
        dets.truncate(params.max_detections);
        Ok(dets)
    }

    fn warm_up(&mut self, _target: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    #[test]
    fn script_then_fixed_output() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let mut backend = ScriptedBackend::new(vec!["Violence".into()])
            .then_emit(vec![RawDetection::new(b, 0, 0.9)])
            .then_fail("cuda out of memory")
            .with_fixed(vec![RawDetection::new(b, 0, 0.1)]);
        let frame = RgbImage::new(8, 8);
        let params = DetectParams::default();

        assert_eq!(backend.detect(&frame, &params).unwrap().len(), 1);
        let err = backend.detect(&frame, &params).unwrap_err();
        assert!(err.to_string().contains("cuda"));
        // fixed output is below the 0.25 threshold
        assert!(backend.detect(&frame, &params).unwrap().is_empty());
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn max_detections_caps_output() {
        let dets = (0..10)
            .map(|i| {
                let x = i as f32 * 20.0;
                RawDetection::new(BoundingBox::new(x, 0.0, x + 10.0, 10.0), 0, 0.5)
            })
            .collect();
        let mut backend = ScriptedBackend::new(vec!["Violence".into()]).then_emit(dets);
        let params = DetectParams {
            max_detections: 3,
            ..DetectParams::default()
        };
        let out = backend.detect(&RgbImage::new(8, 8), &params).unwrap();
        assert_eq!(out.len(), 3);
    }
}
