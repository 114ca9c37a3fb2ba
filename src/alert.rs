//! Alert decision and notification dispatch.
//!
//! [`AlertPolicy::classify`] is the only place that decides whether a
//! detection is alert-worthy. Every alert-worthy detection produces exactly
//! one [`AlertEvent`]; when alerts are enabled each event is handed to the
//! configured [`AlertSink`] exactly once. Nothing is batched or deduplicated.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{labels_match, BoundingBox, Detection};

pub const ALERT_TYPE_VIOLENCE: &str = "violence_detected";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Alert,
    Informational,
}

/// Which class raises alerts, from which confidence, and whether
/// notifications go out at all.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub target_class: String,
    pub threshold: f32,
    pub enabled: bool,
}

impl AlertPolicy {
    pub fn new(target_class: &str, threshold: f32, enabled: bool) -> Result<Self> {
        let policy = Self {
            target_class: target_class.trim().to_string(),
            threshold,
            enabled,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_class.is_empty() {
            return Err(anyhow!("alert class must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(anyhow!(
                "alert threshold must be within 0..=1 (got {})",
                self.threshold
            ));
        }
        Ok(())
    }

    /// Alert iff `confidence >= threshold` and `label` is the target class,
    /// compared case-insensitively as a whole word ("Non-Violence" is not
    /// "violence").
    pub fn classify(&self, label: &str, confidence: f32) -> Verdict {
        if confidence >= self.threshold && labels_match(label, &self.target_class) {
            Verdict::Alert
        } else {
            Verdict::Informational
        }
    }

    pub fn classify_detection(&self, detection: &Detection) -> Verdict {
        self.classify(detection.label(), detection.confidence())
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            target_class: "violence".to_string(),
            threshold: 0.25,
            enabled: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 0.8 {
            Severity::High
        } else if confidence >= 0.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(anyhow!("unknown severity '{}'", other)),
        }
    }
}

/// One alert, produced for exactly one alert-worthy detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub source: String,
    pub alert_type: String,
    pub label: String,
    pub confidence: f32,
    pub severity: Severity,
    pub bbox: BoundingBox,
    pub frame_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn from_detection(detection: &Detection) -> Self {
        Self {
            source: detection.source().to_string(),
            alert_type: ALERT_TYPE_VIOLENCE.to_string(),
            label: detection.label().to_string(),
            confidence: detection.confidence(),
            severity: Severity::from_confidence(detection.confidence()),
            bbox: detection.bbox(),
            frame_time: detection.frame_time(),
            created_at: detection.timestamp(),
        }
    }
}

/// Receives alert notifications. Delivery is best-effort; a failing sink
/// never stops frame processing.
pub trait AlertSink: Send {
    fn name(&self) -> &'static str;

    fn notify(&mut self, event: &AlertEvent) -> Result<()>;
}

/// Writes alerts to the log at warn level.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&mut self, event: &AlertEvent) -> Result<()> {
        log::warn!(
            "ALERT {} on {}: {} ({:.2}, {})",
            event.alert_type,
            event.source,
            event.label,
            event.confidence,
            event.severity.as_str()
        );
        Ok(())
    }
}

/// Collects alerts in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<AlertEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn notify(&mut self, event: &AlertEvent) -> Result<()> {
        let mut guard = self
            .events
            .lock()
            .map_err(|_| anyhow!("recording sink lock poisoned"))?;
        guard.push(event.clone());
        Ok(())
    }
}

/// Outcome of handing one alert to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// Queue full; the notification was dropped.
    Dropped,
}

/// Background notification worker behind a bounded queue.
///
/// `dispatch` never blocks the frame loop: when the queue is full the alert
/// is dropped and a warning logged. The alert itself is still recorded by
/// the pipeline.
pub struct AlertDispatcher {
    sender: Option<SyncSender<AlertEvent>>,
    worker: Option<JoinHandle<u64>>,
    sink_name: &'static str,
    dropped: u64,
}

impl AlertDispatcher {
    pub fn spawn<S: AlertSink + 'static>(mut sink: S, queue_capacity: usize) -> Result<Self> {
        if queue_capacity == 0 {
            return Err(anyhow!("alert queue capacity must be greater than zero"));
        }
        let sink_name = sink.name();
        let (sender, receiver): (SyncSender<AlertEvent>, Receiver<AlertEvent>) =
            mpsc::sync_channel(queue_capacity);
        let worker = std::thread::Builder::new()
            .name(format!("alert-{}", sink_name))
            .spawn(move || {
                let mut delivered = 0u64;
                for event in receiver.iter() {
                    match sink.notify(&event) {
                        Ok(()) => delivered += 1,
                        Err(e) => log::warn!("alert sink {} failed: {:#}", sink_name, e),
                    }
                }
                delivered
            })
            .map_err(|e| anyhow!("failed to spawn alert worker: {}", e))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            sink_name,
            dropped: 0,
        })
    }

    pub fn dispatch(&mut self, event: AlertEvent) -> Dispatch {
        let Some(sender) = self.sender.as_ref() else {
            self.dropped += 1;
            return Dispatch::Dropped;
        };
        match sender.try_send(event) {
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(event)) => {
                self.dropped += 1;
                log::warn!(
                    "alert queue for {} full; dropped notification for {}",
                    self.sink_name,
                    event.source
                );
                Dispatch::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
                log::warn!("alert worker for {} has exited", self.sink_name);
                Dispatch::Dropped
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drain the queue and stop the worker. Returns the number of
    /// notifications the sink accepted.
    pub fn shutdown(mut self) -> Result<u64> {
        self.stop()
    }

    fn stop(&mut self) -> Result<u64> {
        self.sender.take();
        match self.worker.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("alert worker for {} panicked", self.sink_name)),
            None => Ok(0),
        }
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str, confidence: f32) -> Detection {
        Detection::new(
            label,
            confidence,
            BoundingBox::new(1.0, 2.0, 3.0, 4.0),
            None,
            "camera:hall",
        )
        .unwrap()
    }

    #[test]
    fn only_confident_target_class_alerts() {
        let policy = AlertPolicy::new("violence", 0.5, true).unwrap();
        assert_eq!(policy.classify("Violence", 0.9), Verdict::Alert);
        assert_eq!(policy.classify("VIOLENCE", 0.5), Verdict::Alert);
        assert_eq!(policy.classify("Violence", 0.49), Verdict::Informational);
        assert_eq!(policy.classify("Non-Violence", 0.99), Verdict::Informational);
    }

    #[test]
    fn policy_rejects_bad_threshold() {
        assert!(AlertPolicy::new("violence", 1.5, true).is_err());
        assert!(AlertPolicy::new(" ", 0.5, true).is_err());
    }

    #[test]
    fn alert_event_carries_detection_fields() {
        let det = detection("Violence", 0.85);
        let event = AlertEvent::from_detection(&det);
        assert_eq!(event.source, "camera:hall");
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.alert_type, ALERT_TYPE_VIOLENCE);
        assert_eq!(event.bbox, det.bbox());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"severity\":\"high\""));
    }

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::from_confidence(0.3), Severity::Low);
        assert_eq!(Severity::from_confidence(0.5), Severity::Medium);
        assert_eq!(Severity::parse("medium").unwrap(), Severity::Medium);
        assert!(Severity::parse("urgent").is_err());
    }

    #[test]
    fn dispatcher_delivers_every_event_once() {
        let sink = RecordingSink::new();
        let mut dispatcher = AlertDispatcher::spawn(sink.clone(), 16).unwrap();
        for _ in 0..5 {
            let event = AlertEvent::from_detection(&detection("Violence", 0.9));
            assert_eq!(dispatcher.dispatch(event), Dispatch::Queued);
        }
        assert_eq!(dispatcher.shutdown().unwrap(), 5);
        assert_eq!(sink.len(), 5);
    }

    struct BlockingSink {
        gate: Arc<Mutex<()>>,
    }

    impl AlertSink for BlockingSink {
        fn name(&self) -> &'static str {
            "blocking"
        }

        fn notify(&mut self, _event: &AlertEvent) -> Result<()> {
            let _held = self.gate.lock().map_err(|_| anyhow!("poisoned"))?;
            Ok(())
        }
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let mut dispatcher = AlertDispatcher::spawn(BlockingSink { gate: gate.clone() }, 1).unwrap();

        // worker takes at most one event and blocks on the gate; the queue
        // holds one more, so at least one of four is dropped
        let outcomes: Vec<Dispatch> = (0..4)
            .map(|_| dispatcher.dispatch(AlertEvent::from_detection(&detection("Violence", 0.9))))
            .collect();
        assert!(outcomes.contains(&Dispatch::Dropped));
        assert!(dispatcher.dropped() >= 1);

        drop(held);
        dispatcher.shutdown().unwrap();
    }
}
