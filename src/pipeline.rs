//! Per-session detection pipeline.
//!
//! A [`DetectionPipeline`] owns everything one monitoring session needs: the
//! [`SessionConfig`], the detector handle, the class table, the bounded event
//! log and the optional persistence and notification sinks. There is no
//! process-wide state; two pipelines never share a log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::alert::{AlertDispatcher, AlertEvent, AlertPolicy, Dispatch, Verdict};
use crate::analytics::{summarize, FpsMeter, LogSummary};
use crate::annotate::draw_detections;
use crate::cache::{ContentKey, KeyedCache};
use crate::classes::ClassTable;
use crate::detect::{BackendHandle, DetectParams, RawDetection};
use crate::event_log::{EventLog, Truncation};
use crate::ingest::FrameSource;
use crate::letterbox::{Letterbox, ScaleRemap};
use crate::storage::DetectionStore;
use crate::{is_invalid_input, Detection, InvalidInput};

const HEALTH_LOG_EVERY: u64 = 100;

/// How frames are fitted to the detector's square input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitMode {
    /// Aspect-preserving resize plus padding; boxes mapped back exactly.
    Letterbox,
    /// Plain resize to `T x T`; boxes mapped back with per-axis scale.
    Stretch,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub target_size: u32,
    pub detect: DetectParams,
    pub alert: AlertPolicy,
    /// On video and live streams, frame `n` (from 1) is processed iff
    /// `n % frame_stride == 0`. Image batches ignore it.
    pub frame_stride: u64,
    pub max_log_size: usize,
    pub fit: FitMode,
    /// Attach an annotated copy of the source frame to each report.
    pub annotate: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_size: 800,
            detect: DetectParams::default(),
            alert: AlertPolicy::default(),
            frame_stride: 1,
            max_log_size: 5000,
            fit: FitMode::Letterbox,
            annotate: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_size == 0 {
            return Err(anyhow!("target size must be greater than zero"));
        }
        if self.frame_stride == 0 {
            return Err(anyhow!("frame stride must be at least 1"));
        }
        if self.max_log_size == 0 {
            return Err(anyhow!("max log size must be at least 1"));
        }
        self.detect.validate()?;
        self.alert.validate()
    }
}

/// Outcome of one processed frame.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub source_id: String,
    pub detections: Vec<Detection>,
    pub alerts: Vec<AlertEvent>,
    pub truncation: Option<Truncation>,
    /// Set when the detector failed on this frame; `detections` is then empty.
    pub detector_error: Option<String>,
    pub annotated: Option<RgbImage>,
    pub elapsed: Duration,
}

impl FrameReport {
    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub invalid_inputs: u64,
    pub source_errors: u64,
    pub detector_failures: u64,
    pub detections: u64,
    pub alerts: u64,
    pub notifications_dropped: u64,
    pub truncations: u64,
    pub stopped: bool,
}

enum Remap {
    Exact(Letterbox),
    Stretch(ScaleRemap),
}

impl Remap {
    fn to_source(&self, bbox: &crate::BoundingBox) -> crate::BoundingBox {
        match self {
            Remap::Exact(letterbox) => letterbox.to_source(bbox),
            Remap::Stretch(scale) => scale.apply(bbox),
        }
    }
}

pub struct DetectionPipeline {
    config: SessionConfig,
    backend: BackendHandle,
    classes: ClassTable,
    log: EventLog,
    dispatcher: Option<AlertDispatcher>,
    store: Option<Box<dyn DetectionStore>>,
    summaries: KeyedCache<LogSummary>,
    stats: RunStats,
}

impl DetectionPipeline {
    /// Fails when the config is invalid or the class table lacks the alert
    /// class.
    pub fn new(config: SessionConfig, backend: BackendHandle, classes: ClassTable) -> Result<Self> {
        config.validate()?;
        classes.require_class(&config.alert.target_class)?;
        let log = EventLog::new(config.max_log_size)?;
        Ok(Self {
            config,
            backend,
            classes,
            log,
            dispatcher: None,
            store: None,
            summaries: KeyedCache::new(4),
            stats: RunStats::default(),
        })
    }

    pub fn with_dispatcher(mut self, dispatcher: AlertDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_store(mut self, store: Box<dyn DetectionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn store_mut(&mut self) -> Option<&mut (dyn DetectionStore + 'static)> {
        self.store.as_deref_mut()
    }

    /// Empty the event log. Persisted rows are kept.
    pub fn reset_log(&mut self) {
        self.log.clear();
        self.summaries.clear();
    }

    pub fn warm_up(&self) -> Result<()> {
        let mut backend = self
            .backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?;
        backend.warm_up(self.config.target_size)
    }

    /// Summary of the current log, recomputed only when the log changed.
    pub fn summary(&mut self) -> Result<LogSummary> {
        let key = ContentKey::from_parts(&[
            &self.log.generation().to_le_bytes(),
            self.config.alert.target_class.as_bytes(),
        ]);
        let entries = self.log.get_all();
        let alert_class = &self.config.alert.target_class;
        self.summaries
            .get_or_try_insert_with(key, || Ok(summarize(entries, alert_class)))
    }

    /// Decode `bytes` and process them as one frame.
    pub fn process_image_bytes(&mut self, bytes: &[u8], source_id: &str) -> Result<FrameReport> {
        let image = image::load_from_memory(bytes).map_err(|e| {
            self.stats.invalid_inputs += 1;
            anyhow::Error::new(InvalidInput::new(format!("undecodable image: {}", e)))
        })?;
        self.process_frame(&image, source_id, Utc::now())
    }

    /// Letterbox, detect, remap, decide, log, persist and notify one frame.
    ///
    /// Returns `Err` only for input that never reached the detector. A
    /// detector failure is reported in [`FrameReport::detector_error`].
    pub fn process_frame(
        &mut self,
        image: &DynamicImage,
        source_id: &str,
        frame_time: DateTime<Utc>,
    ) -> Result<FrameReport> {
        let started = Instant::now();
        let (input, remap) = match self.prepare(image) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.stats.invalid_inputs += 1;
                return Err(e);
            }
        };

        let mut report = FrameReport {
            source_id: source_id.to_string(),
            detections: Vec::new(),
            alerts: Vec::new(),
            truncation: None,
            detector_error: None,
            annotated: None,
            elapsed: Duration::ZERO,
        };

        match self.run_detector(&input) {
            Ok(raw) => {
                report.detections = self.label_detections(&raw, &remap, source_id, frame_time);
            }
            Err(e) => {
                self.stats.detector_failures += 1;
                log::warn!("detector failed on {}: {:#}", source_id, e);
                report.detector_error = Some(format!("{:#}", e));
            }
        }

        for det in &report.detections {
            if self.config.alert.classify_detection(det) == Verdict::Alert {
                report.alerts.push(AlertEvent::from_detection(det));
            }
        }

        self.persist(&report);
        self.notify(&report.alerts);

        report.truncation = self.log.append(report.detections.iter().cloned());
        if report.truncation.is_some() {
            self.stats.truncations += 1;
        }

        if self.config.annotate {
            let mut annotated = image.to_rgb8();
            draw_detections(
                &mut annotated,
                &report.detections,
                &self.config.alert.target_class,
            );
            report.annotated = Some(annotated);
        }

        self.stats.frames_processed += 1;
        self.stats.detections += report.detections.len() as u64;
        self.stats.alerts += report.alerts.len() as u64;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// Pull frames until the source ends or `stop` is set.
    pub fn run_source(&mut self, source: &mut dyn FrameSource, stop: &AtomicBool) -> RunStats {
        self.run_source_with(source, stop, |_| {})
    }

    /// Like [`run_source`](Self::run_source), handing every report to
    /// `on_report` before the next frame is read.
    pub fn run_source_with<F>(
        &mut self,
        source: &mut dyn FrameSource,
        stop: &AtomicBool,
        mut on_report: F,
    ) -> RunStats
    where
        F: FnMut(&FrameReport),
    {
        let stride = if source.is_stream() {
            self.config.frame_stride
        } else {
            1
        };
        let live = source.is_live();
        let mut fps = FpsMeter::default();
        let mut low_fps_warned = false;
        let mut position = 0u64;

        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("stop requested; leaving {}", source.source_id());
                self.stats.stopped = true;
                break;
            }

            let next = source.next_frame();
            if matches!(next, Ok(None)) {
                break;
            }
            position += 1;
            self.stats.frames_seen += 1;
            if position % stride != 0 {
                self.stats.frames_skipped += 1;
                continue;
            }

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) if is_invalid_input(&e) => {
                    self.stats.invalid_inputs += 1;
                    log::warn!("skipping frame {}: {:#}", position, e);
                    continue;
                }
                Err(e) => {
                    self.stats.source_errors += 1;
                    log::warn!("source {} failed on frame {}: {:#}", source.source_id(), position, e);
                    continue;
                }
            };

            match self.process_frame(&frame.image, &frame.source_id, frame.frame_time) {
                Ok(report) => {
                    if live {
                        fps.record(report.elapsed);
                        if fps.is_low() && !low_fps_warned {
                            log::warn!(
                                "low FPS on {} ({:.1}); increase the frame stride or reduce the target size",
                                source.source_id(),
                                fps.fps().unwrap_or(0.0)
                            );
                        }
                        low_fps_warned = fps.is_low();
                    }
                    on_report(&report);
                }
                Err(e) => log::warn!("skipping frame {}: {:#}", position, e),
            }

            if self.stats.frames_processed > 0 && self.stats.frames_processed % HEALTH_LOG_EVERY == 0 {
                log::info!(
                    "health: processed={} skipped={} detections={} alerts={} log_len={}",
                    self.stats.frames_processed,
                    self.stats.frames_skipped,
                    self.stats.detections,
                    self.stats.alerts,
                    self.log.len()
                );
            }
        }

        self.stats
    }

    /// Stop the notification worker after it drains its queue.
    pub fn shutdown(mut self) -> Result<RunStats> {
        if let Some(dispatcher) = self.dispatcher.take() {
            let delivered = dispatcher.shutdown()?;
            log::info!("alert notifications delivered: {}", delivered);
        }
        Ok(self.stats)
    }

    fn prepare(&self, image: &DynamicImage) -> Result<(RgbImage, Remap)> {
        let target = self.config.target_size;
        match self.config.fit {
            FitMode::Letterbox => {
                let letterbox = Letterbox::for_image(image, target)?;
                let input = letterbox.apply(image)?;
                Ok((input, Remap::Exact(letterbox)))
            }
            FitMode::Stretch => {
                let remap = ScaleRemap::new(image.height(), image.width(), target)?;
                let input = image
                    .resize_exact(target, target, FilterType::Triangle)
                    .to_rgb8();
                Ok((input, Remap::Stretch(remap)))
            }
        }
    }

    fn run_detector(&self, input: &RgbImage) -> Result<Vec<RawDetection>> {
        let mut backend = self
            .backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?;
        backend.detect(input, &self.config.detect)
    }

    fn label_detections(
        &self,
        raw: &[RawDetection],
        remap: &Remap,
        source_id: &str,
        frame_time: DateTime<Utc>,
    ) -> Vec<Detection> {
        let mut out = Vec::with_capacity(raw.len());
        for r in raw {
            let Some(label) = self.classes.label(r.class_index) else {
                log::warn!(
                    "detector returned class index {} outside the {}-class table",
                    r.class_index,
                    self.classes.len()
                );
                continue;
            };
            if r.confidence.is_nan() {
                continue;
            }
            if !r.bbox.is_finite() {
                log::warn!(
                    "dropping {} box with non-finite coordinates on {}: {:?}",
                    label,
                    source_id,
                    r.bbox
                );
                continue;
            }
            let bbox = remap.to_source(&r.bbox);
            match Detection::new(
                label,
                r.confidence.clamp(0.0, 1.0),
                bbox,
                Some(frame_time),
                source_id,
            ) {
                Ok(det) => out.push(det),
                Err(e) => log::warn!("dropping detection on {}: {:#}", source_id, e),
            }
        }
        out
    }

    fn persist(&mut self, report: &FrameReport) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        for det in &report.detections {
            if let Err(e) = store.append_detection(det) {
                log::warn!("failed to persist detection: {:#}", e);
            }
        }
        for alert in &report.alerts {
            if let Err(e) = store.record_alert(alert) {
                log::warn!("failed to persist alert: {:#}", e);
            }
        }
    }

    fn notify(&mut self, alerts: &[AlertEvent]) {
        if !self.config.alert.enabled {
            return;
        }
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return;
        };
        for alert in alerts {
            if dispatcher.dispatch(alert.clone()) == Dispatch::Dropped {
                self.stats.notifications_dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedBackend;
    use crate::BoundingBox;
    use std::sync::{Arc, Mutex};

    fn pipeline(backend: ScriptedBackend, config: SessionConfig) -> DetectionPipeline {
        let classes = ClassTable::from_names(["Non-Violence", "Violence"]).unwrap();
        DetectionPipeline::new(config, Arc::new(Mutex::new(backend)), classes).unwrap()
    }

    fn config(target: u32) -> SessionConfig {
        SessionConfig {
            target_size: target,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn boxes_are_mapped_back_to_source_frame() {
        // 200x100 source into a 100 canvas: scale 0.5, 25 px of padding top and bottom
        let backend = ScriptedBackend::new(vec![]).then_emit(vec![RawDetection::new(
            BoundingBox::new(10.0, 25.0, 60.0, 75.0),
            1,
            0.9,
        )]);
        let mut p = pipeline(backend, config(100));
        let image = DynamicImage::new_rgb8(200, 100);
        let report = p.process_frame(&image, "cam", Utc::now()).unwrap();
        let bbox = report.detections[0].bbox();
        assert!((bbox.x1 - 20.0).abs() < 1e-3);
        assert!((bbox.y1 - 0.0).abs() < 1e-3);
        assert!((bbox.x2 - 120.0).abs() < 1e-3);
        assert!((bbox.y2 - 100.0).abs() < 1e-3);
        assert_eq!(report.alerts.len(), 1);
    }

    #[test]
    fn stretch_mode_uses_scale_only_remap() {
        let backend = ScriptedBackend::new(vec![]).then_emit(vec![RawDetection::new(
            BoundingBox::new(10.0, 10.0, 50.0, 50.0),
            1,
            0.9,
        )]);
        let cfg = SessionConfig {
            fit: FitMode::Stretch,
            ..config(100)
        };
        let mut p = pipeline(backend, cfg);
        let image = DynamicImage::new_rgb8(200, 100);
        let report = p.process_frame(&image, "cam", Utc::now()).unwrap();
        assert_eq!(report.detections[0].bbox(), BoundingBox::new(20.0, 10.0, 100.0, 50.0));
    }

    #[test]
    fn missing_alert_class_refuses_to_start() {
        let classes = ClassTable::from_names(["person"]).unwrap();
        let backend = Arc::new(Mutex::new(ScriptedBackend::new(vec![])));
        assert!(DetectionPipeline::new(SessionConfig::default(), backend, classes).is_err());
    }

    #[test]
    fn summary_is_cached_until_log_changes() {
        let b = BoundingBox::new(0.0, 0.0, 5.0, 5.0);
        let backend = ScriptedBackend::new(vec![]).with_fixed(vec![RawDetection::new(b, 1, 0.9)]);
        let mut p = pipeline(backend, config(32));
        let image = DynamicImage::new_rgb8(32, 32);

        p.process_frame(&image, "cam", Utc::now()).unwrap();
        assert_eq!(p.summary().unwrap().alert_class_count, 1);
        assert_eq!(p.summary().unwrap().alert_class_count, 1);
        assert_eq!(p.summaries.stats().hits, 1);

        p.process_frame(&image, "cam", Utc::now()).unwrap();
        assert_eq!(p.summary().unwrap().alert_class_count, 2);

        p.reset_log();
        assert_eq!(p.summary().unwrap().total, 0);
    }

    #[test]
    fn annotation_is_attached_on_request() {
        let b = BoundingBox::new(4.0, 4.0, 20.0, 20.0);
        let backend = ScriptedBackend::new(vec![]).with_fixed(vec![RawDetection::new(b, 1, 0.9)]);
        let cfg = SessionConfig {
            annotate: true,
            ..config(32)
        };
        let mut p = pipeline(backend, cfg);
        let report = p
            .process_frame(&DynamicImage::new_rgb8(32, 32), "cam", Utc::now())
            .unwrap();
        let annotated = report.annotated.unwrap();
        assert_eq!(*annotated.get_pixel(4, 10), crate::annotate::ALERT_COLOR);
    }

    #[test]
    fn zero_stride_is_rejected() {
        let cfg = SessionConfig {
            frame_stride: 0,
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
