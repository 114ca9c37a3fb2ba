use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::cache::{ContentKey, KeyedCache};
use crate::detect::backend::DetectorBackend;
use crate::detect::nms::non_max_suppression;
use crate::detect::result::{DetectParams, RawDetection};
use crate::BoundingBox;

/// Optimised, runnable ONNX plan shared between backends loaded from the same file.
pub type TractPlan = Arc<TypedRunnableModel<TypedModel>>;

const BOX_CHANNELS: usize = 4;
const PLAN_CACHE_CAPACITY: usize = 4;

/// Plans built in this process, keyed by SHA-256 of the model bytes and input size.
fn shared_plans() -> &'static Mutex<KeyedCache<TractPlan>> {
    static PLANS: OnceLock<Mutex<KeyedCache<TractPlan>>> = OnceLock::new();
    PLANS.get_or_init(|| Mutex::new(KeyedCache::new(PLAN_CACHE_CAPACITY)))
}

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a `[1, 3, T, T]` float input in `0..=1` and a `[1, 4 + nc, N]`
/// output holding `cx, cy, w, h` followed by one score per class.
pub struct TractBackend {
    plan: TractPlan,
    input_size: u32,
    class_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference. A model
    /// already optimised in this process at the same size is reused.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let mut plans = shared_plans()
            .lock()
            .map_err(|_| anyhow!("tract plan cache lock poisoned"))?;
        Self::load_cached(&mut plans, model_path, input_size, class_names)
    }

    /// Load through a caller-owned plan cache.
    pub fn load_cached<P: AsRef<Path>>(
        cache: &mut KeyedCache<TractPlan>,
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let bytes = read_model(model_path.as_ref())?;
        let key = ContentKey::from_parts(&[&bytes, &input_size.to_le_bytes()]);
        let plan = cache.get_or_try_insert_with(key, || build_plan(&bytes, input_size))?;
        Ok(Self {
            plan,
            input_size,
            class_names,
        })
    }

    fn build_input(&self, frame: &RgbImage) -> Result<Tensor> {
        if frame.width() != self.input_size || frame.height() != self.input_size {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width(),
                frame.height(),
                self.input_size,
                self.input_size
            ));
        }

        let size = self.input_size as usize;
        let pixels = frame.as_raw();
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            pixels[(y * size + x) * 3 + c] as f32 / 255.0
        });

        Ok(input.into_tensor())
    }
}

/// Decode a `[1, 4 + nc, N]` YOLOv8 head into class-aware, NMS-filtered detections.
fn decode_output(output: &Tensor, params: &DetectParams) -> Result<Vec<RawDetection>> {
    let view = output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?
        .into_dimensionality::<tract_ndarray::Ix3>()
        .context("expected a [1, 4 + nc, N] output")?;
    let (_, channels, anchors) = view.dim();
    if channels <= BOX_CHANNELS {
        return Err(anyhow!("model output has {} channels, no class scores", channels));
    }
    let num_classes = channels - BOX_CHANNELS;

    let mut dets = Vec::new();
    for i in 0..anchors {
        let (class_index, score) = (0..num_classes)
            .map(|c| (c, view[[0, BOX_CHANNELS + c, i]]))
            .fold((0, f32::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            });
        if !score.is_finite() || score < params.confidence {
            continue;
        }
        let bbox = BoundingBox::from_center(
            view[[0, 0, i]],
            view[[0, 1, i]],
            view[[0, 2, i]],
            view[[0, 3, i]],
        );
        if !bbox.is_finite() {
            continue;
        }
        dets.push(RawDetection::new(bbox, class_index, score.min(1.0)));
    }

    non_max_suppression(&mut dets, params.iou);
    dets.truncate(params.max_detections);
    Ok(dets)
}

fn read_model(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read ONNX model {}", path.display()))
}

fn build_plan(bytes: &[u8], input_size: u32) -> Result<TractPlan> {
    let size = input_size as usize;
    let plan = tract_onnx::onnx()
        .model_for_read(&mut Cursor::new(bytes))
        .context("failed to parse ONNX model")?
        .with_input_fact(0, f32::fact([1, 3, size, size]).into())
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")?;
    Ok(Arc::new(plan))
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_names(&self) -> Option<Vec<String>> {
        Some(self.class_names.clone())
    }

    fn detect(&mut self, frame: &RgbImage, params: &DetectParams) -> Result<Vec<RawDetection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        decode_output(output, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(values: Vec<f32>, anchors: usize) -> Tensor {
        let channels = values.len() / anchors;
        tract_ndarray::Array3::from_shape_vec((1, channels, anchors), values)
            .unwrap()
            .into_tensor()
    }

    #[test]
    fn decode_keeps_best_class_and_skips_non_finite_boxes() {
        // channels: cx, cy, w, h, score(non-violence), score(violence)
        let output = head(
            vec![
                50.0, f32::NAN, //
                50.0, 30.0, //
                20.0, 10.0, //
                20.0, 10.0, //
                0.1, 0.0, //
                0.9, 0.8,
            ],
            2,
        );
        let dets = decode_output(&output, &DetectParams::default()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_index, 1);
        assert_eq!(dets[0].bbox, BoundingBox::new(40.0, 40.0, 60.0, 60.0));
    }

    #[test]
    fn decode_rejects_heads_without_class_scores() {
        let output = head(vec![1.0, 2.0, 3.0, 4.0], 1);
        assert!(decode_output(&output, &DetectParams::default()).is_err());
    }

    #[test]
    fn failed_loads_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("broken.onnx");
        std::fs::write(&model, b"not an onnx graph").unwrap();

        let mut plans = KeyedCache::new(2);
        for _ in 0..2 {
            let err = TractBackend::load_cached(&mut plans, &model, 64, vec!["Violence".into()])
                .err()
                .unwrap();
            assert!(format!("{:#}", err).contains("failed to parse ONNX model"));
        }
        assert!(plans.is_empty());
        assert_eq!(plans.stats().misses, 2);

        assert!(TractBackend::new(dir.path().join("missing.onnx"), 64, vec![]).is_err());
    }
}
