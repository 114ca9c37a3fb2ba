//! violence-watch
//!
//! Detection core for a child-safety monitoring deployment. Frames from
//! uploaded images or a live feed are letterboxed for a square-input detector,
//! the detector's boxes are mapped back to the source frame, alert-worthy
//! detections are dispatched, and everything lands in a bounded event log.
//!
//! # Processing order
//!
//! Each frame is processed to completion before the next one is read:
//!
//! 1. **Letterbox**: resize preserving aspect ratio, pad to `T x T`.
//! 2. **Detect**: opaque backend returns boxes in detector space.
//! 3. **Remap**: exact inverse of the letterbox, clamped to the source frame.
//! 4. **Decide**: alert iff the label is the watched class and the
//!    confidence crosses the threshold.
//! 5. **Log**: append to the bounded log (halve-and-keep-tail on overflow),
//!    persist, notify.
//!
//! # Module Structure
//!
//! - `letterbox`: forward/inverse letterbox transform
//! - `detect`: detector backend trait, registry, scripted and tract backends
//! - `alert`: alert policy and notification sinks
//! - `event_log`: bounded detection log
//! - `pipeline`: per-session context tying the above together
//! - `storage`: detection/alert persistence
//! - `ingest`: frame sources (image files, synthetic feed)
//! - `analytics`: summaries, filters and CSV export of the log
//! - `transport`: MQTT alert notifications

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub mod alert;
pub mod analytics;
pub mod annotate;
pub mod cache;
pub mod classes;
pub mod config;
pub mod detect;
pub mod event_log;
pub mod ingest;
pub mod letterbox;
pub mod pipeline;
pub mod storage;
pub mod transport;
pub mod ui;

pub use alert::{AlertDispatcher, AlertEvent, AlertPolicy, AlertSink, LogAlertSink, Verdict};
pub use cache::{ContentKey, KeyedCache};
pub use classes::ClassTable;
pub use detect::{BackendRegistry, DetectParams, DetectorBackend, RawDetection, ScriptedBackend};
pub use event_log::{EventLog, SharedEventLog, Truncation};
pub use ingest::{FrameSource, ImageFilesSource, SourceFrame, SyntheticSource};
pub use letterbox::{Letterbox, ScaleRemap};
pub use pipeline::{DetectionPipeline, FrameReport, RunStats, SessionConfig};
pub use storage::{DetectionStore, InMemoryDetectionStore, SqliteDetectionStore, StoredAlert};

// -------------------- Errors --------------------

/// Input rejected before it reached the detector.
///
/// Zero-sized frames, undecodable image bytes and a zero target size all map
/// here. Carried inside `anyhow::Error`; use [`is_invalid_input`] to tell it
/// apart from detector or storage failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidInput {
    pub reason: String,
}

impl InvalidInput {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid input: {}", self.reason)
    }
}

impl std::error::Error for InvalidInput {}

/// Returns true when `err` (or anything in its chain) is an [`InvalidInput`].
pub fn is_invalid_input(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<InvalidInput>().is_some())
}

// -------------------- Bounding Boxes --------------------

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left and `(x2, y2)`
/// bottom-right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a center/size box as emitted by YOLO-style heads.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_degenerate(&self) -> bool {
        self.area() <= 0.0
    }

    pub fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Clamp every corner into `[0, width] x [0, height]`. NaN maps to 0.
    pub fn clamp_to(self, width: f32, height: f32) -> Self {
        Self {
            x1: clamp_coord(self.x1, width),
            y1: clamp_coord(self.y1, height),
            x2: clamp_coord(self.x2, width),
            y2: clamp_coord(self.y2, height),
        }
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

fn clamp_coord(value: f32, max: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, max)
    }
}

// -------------------- Detections --------------------

/// One labelled detection in source-frame coordinates.
///
/// Fields are private: a detection is never edited after the pipeline builds it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    label: String,
    confidence: f32,
    bbox: BoundingBox,
    timestamp: DateTime<Utc>,
    frame_time: DateTime<Utc>,
    source: String,
}

impl Detection {
    /// Build a detection stamped with the current time.
    pub fn new(
        label: &str,
        confidence: f32,
        bbox: BoundingBox,
        frame_time: Option<DateTime<Utc>>,
        source: &str,
    ) -> Result<Self> {
        let now = Utc::now();
        Self::recorded_at(label, confidence, bbox, now, frame_time.unwrap_or(now), source)
    }

    /// Build a detection with an explicit record timestamp.
    pub fn recorded_at(
        label: &str,
        confidence: f32,
        bbox: BoundingBox,
        timestamp: DateTime<Utc>,
        frame_time: DateTime<Utc>,
        source: &str,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!("detection confidence {} out of bounds", confidence));
        }
        if label.trim().is_empty() {
            return Err(anyhow!("detection label must not be empty"));
        }
        if !bbox.is_finite() {
            return Err(anyhow!("detection box {:?} has a non-finite coordinate", bbox));
        }
        Ok(Self {
            label: label.to_string(),
            confidence,
            bbox,
            timestamp,
            frame_time,
            source: source.to_string(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn frame_time(&self) -> DateTime<Utc> {
        self.frame_time
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Case-insensitive exact label match.
    pub fn is_class(&self, class: &str) -> bool {
        labels_match(&self.label, class)
    }
}

pub(crate) fn labels_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

// -------------------- Source ID Discipline --------------------

/// A source id names a camera, feed or upload, e.g. "camera:hall_2",
/// "live-feed", "img_0042.jpg".
pub fn validate_source_id(source_id: &str) -> Result<()> {
    static SOURCE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = SOURCE_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9][a-z0-9_.:-]{0,63}$").expect("static regex")
    });

    if !re.is_match(&source_id.to_lowercase()) {
        return Err(anyhow!(
            "source id must match ^[a-z0-9][a-z0-9_.:-]{{0,63}}$ (got '{}')",
            source_id
        ));
    }
    Ok(())
}

/// Map an arbitrary name (file name, device path) onto a valid source id.
pub fn sanitize_source_id(name: &str) -> String {
    let mut out: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | ':' | '-' => c,
            _ => '_',
        })
        .take(64)
        .collect();
    if !out
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
    {
        out.insert(0, 's');
        out.truncate(64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_rejects_out_of_range_confidence() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(Detection::new("Violence", 1.2, bbox, None, "cam").is_err());
        assert!(Detection::new("Violence", f32::NAN, bbox, None, "cam").is_err());
        assert!(Detection::new("Violence", 0.0, bbox, None, "cam").is_ok());
    }

    #[test]
    fn detection_class_match_ignores_case() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let det = Detection::new("Violence", 0.9, bbox, None, "cam").unwrap();
        assert!(det.is_class("violence"));
        assert!(det.is_class("VIOLENCE"));
        assert!(!det.is_class("non-violence"));
    }

    #[test]
    fn clamp_maps_nan_corners_to_zero() {
        let clamped = BoundingBox::new(f32::NAN, -5.0, f32::INFINITY, f32::NAN).clamp_to(96.0, 64.0);
        assert_eq!(clamped, BoundingBox::new(0.0, 0.0, 96.0, 0.0));
        assert!(clamped.is_finite());

        let bad = BoundingBox::new(f32::NAN, 8.0, 40.0, 40.0);
        assert!(!bad.is_finite());
        assert!(Detection::new("Violence", 0.9, bad, None, "cam").is_err());
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        let b = BoundingBox::new(30.0, 30.0, 40.0, 40.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn source_id_allowlist() {
        assert!(validate_source_id("camera:hall_2").is_ok());
        assert!(validate_source_id("Live-Feed").is_ok());
        assert!(validate_source_id("cam/1").is_err());
        assert!(validate_source_id("").is_err());
        assert!(validate_source_id(" cam").is_err());
    }

    #[test]
    fn sanitize_produces_valid_ids() {
        for name in ["IMG 0042.JPG", "../etc/passwd", "_hidden", "", "Live Feed"] {
            let id = sanitize_source_id(name);
            validate_source_id(&id).unwrap_or_else(|e| panic!("{name:?} -> {id:?}: {e}"));
        }
        assert_eq!(sanitize_source_id("IMG 0042.JPG"), "img_0042.jpg");
    }

    #[test]
    fn invalid_input_survives_context() {
        let err = anyhow::Error::new(InvalidInput::new("zero width")).context("frame 3");
        assert!(is_invalid_input(&err));
        assert!(!is_invalid_input(&anyhow!("detector crashed")));
    }
}
