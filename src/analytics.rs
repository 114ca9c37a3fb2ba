//! Summaries, filters and exports over logged detections.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Timelike};
use serde::Serialize;

use crate::{labels_match, Detection};

pub const CSV_HEADER: &str = "Timestamp,Class,Confidence,FrameTime,FileName";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LogSummary {
    pub total: usize,
    pub alert_class_count: usize,
    pub other_count: usize,
    /// Keyed by label as logged.
    pub per_class: BTreeMap<String, usize>,
    /// `None` for an empty log.
    pub average_confidence: Option<f32>,
}

pub fn summarize(entries: &[Detection], alert_class: &str) -> LogSummary {
    let mut summary = LogSummary {
        total: entries.len(),
        ..LogSummary::default()
    };
    let mut confidence_sum = 0.0f64;
    for det in entries {
        if det.is_class(alert_class) {
            summary.alert_class_count += 1;
        } else {
            summary.other_count += 1;
        }
        *summary.per_class.entry(det.label().to_string()).or_insert(0) += 1;
        confidence_sum += det.confidence() as f64;
    }
    if !entries.is_empty() {
        summary.average_confidence = Some((confidence_sum / entries.len() as f64) as f32);
    }
    summary
}

/// Selection applied by [`filter`]. Empty `classes` keeps every class;
/// dates are inclusive UTC calendar days of the record timestamp.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub classes: Vec<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl LogFilter {
    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(anyhow!("date range start {} is after end {}", from, to));
            }
        }
        Ok(())
    }

    pub fn matches(&self, det: &Detection) -> bool {
        if !self.classes.is_empty() && !self.classes.iter().any(|c| labels_match(c, det.label())) {
            return false;
        }
        let day = det.timestamp().date_naive();
        if self.from.is_some_and(|from| day < from) {
            return false;
        }
        if self.to.is_some_and(|to| day > to) {
            return false;
        }
        true
    }
}

pub fn filter(entries: &[Detection], selection: &LogFilter) -> Result<Vec<Detection>> {
    selection.validate()?;
    Ok(entries
        .iter()
        .filter(|det| selection.matches(det))
        .cloned()
        .collect())
}

/// Detections per hour of day (UTC), per label. Every label present gets
/// all 24 buckets.
pub fn hourly_pattern(entries: &[Detection]) -> BTreeMap<String, [usize; 24]> {
    let mut pattern: BTreeMap<String, [usize; 24]> = BTreeMap::new();
    for det in entries {
        let hour = det.timestamp().hour() as usize;
        pattern.entry(det.label().to_string()).or_insert([0; 24])[hour] += 1;
    }
    pattern
}

pub fn labels(entries: &[Detection]) -> BTreeSet<String> {
    entries.iter().map(|d| d.label().to_string()).collect()
}

pub fn to_csv(entries: &[Detection]) -> String {
    let mut out = String::with_capacity(64 * (entries.len() + 1));
    out.push_str(CSV_HEADER);
    out.push_str("\r\n");
    for det in entries {
        let fields = [
            det.timestamp().to_rfc3339(),
            det.label().to_string(),
            format!("{:.4}", det.confidence()),
            det.frame_time().to_rfc3339(),
            det.source().to_string(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push_str("\r\n");
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn to_json(entries: &[Detection]) -> Result<String> {
    serde_json::to_string_pretty(entries).context("failed to serialise detections")
}

/// Rolling frame rate over the last few frame durations.
#[derive(Clone, Debug)]
pub struct FpsMeter {
    window: usize,
    samples: VecDeque<Duration>,
}

pub const FPS_WINDOW: usize = 10;
pub const LOW_FPS: f32 = 10.0;

impl FpsMeter {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    pub fn fps(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        let mean = total.as_secs_f32() / self.samples.len() as f32;
        if mean <= 0.0 {
            return None;
        }
        Some(1.0 / mean)
    }

    /// True once a full window averages below [`LOW_FPS`].
    pub fn is_low(&self) -> bool {
        self.samples.len() == self.window && self.fps().is_some_and(|fps| fps < LOW_FPS)
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;
    use chrono::{TimeZone, Utc};

    fn at(label: &str, conf: f32, day: u32, hour: u32, source: &str) -> Detection {
        let ts = Utc.with_ymd_and_hms(2024, 3, day, hour, 15, 0).unwrap();
        Detection::recorded_at(label, conf, BoundingBox::default(), ts, ts, source).unwrap()
    }

    #[test]
    fn summary_counts_alert_class_case_insensitively() {
        let log = vec![
            at("Violence", 0.9, 1, 9, "a.jpg"),
            at("violence", 0.7, 1, 9, "b.jpg"),
            at("Non-Violence", 0.5, 1, 10, "c.jpg"),
        ];
        let s = summarize(&log, "VIOLENCE");
        assert_eq!(s.total, 3);
        assert_eq!(s.alert_class_count, 2);
        assert_eq!(s.other_count, 1);
        assert_eq!(s.per_class.get("Non-Violence"), Some(&1));
        assert!((s.average_confidence.unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(summarize(&[], "violence").average_confidence, None);
    }

    #[test]
    fn filter_by_class_and_inclusive_dates() {
        let log = vec![
            at("Violence", 0.9, 1, 9, "a"),
            at("Non-Violence", 0.5, 2, 9, "b"),
            at("Violence", 0.8, 3, 9, "c"),
            at("Violence", 0.8, 4, 9, "d"),
        ];
        let sel = LogFilter {
            classes: vec!["violence".into()],
            from: NaiveDate::from_ymd_opt(2024, 3, 1),
            to: NaiveDate::from_ymd_opt(2024, 3, 3),
        };
        let out = filter(&log, &sel).unwrap();
        let sources: Vec<&str> = out.iter().map(|d| d.source()).collect();
        assert_eq!(sources, vec!["a", "c"]);

        let backwards = LogFilter {
            from: NaiveDate::from_ymd_opt(2024, 3, 5),
            to: NaiveDate::from_ymd_opt(2024, 3, 1),
            ..LogFilter::default()
        };
        assert!(filter(&log, &backwards).is_err());
    }

    #[test]
    fn hourly_pattern_buckets_per_label() {
        let log = vec![
            at("Violence", 0.9, 1, 9, "a"),
            at("Violence", 0.9, 2, 9, "b"),
            at("Violence", 0.9, 2, 23, "c"),
            at("Non-Violence", 0.9, 2, 0, "d"),
        ];
        let p = hourly_pattern(&log);
        assert_eq!(p["Violence"][9], 2);
        assert_eq!(p["Violence"][23], 1);
        assert_eq!(p["Non-Violence"][0], 1);
        assert_eq!(p["Non-Violence"].iter().sum::<usize>(), 1);
    }

    #[test]
    fn csv_quotes_awkward_file_names() {
        let log = vec![at("Violence", 0.9, 1, 9, "yard, \"north\".jpg")];
        let csv = to_csv(&log);
        let mut lines = csv.split("\r\n");
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().unwrap();
        assert!(row.ends_with(",\"yard, \"\"north\"\".jpg\""));
        assert!(row.contains(",Violence,0.9000,"));
    }

    #[test]
    fn json_export_lists_every_entry() {
        let log = vec![at("Violence", 0.9, 1, 9, "a"), at("Violence", 0.9, 1, 9, "b")];
        let json = to_json(&log).unwrap();
        let parsed: Vec<Detection> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, log);
    }

    #[test]
    fn fps_meter_flags_slow_feed_after_full_window() {
        let mut meter = FpsMeter::default();
        for _ in 0..9 {
            meter.record(Duration::from_millis(200));
        }
        assert!(!meter.is_low());
        meter.record(Duration::from_millis(200));
        assert!(meter.is_low());
        assert!((meter.fps().unwrap() - 5.0).abs() < 1e-3);

        for _ in 0..10 {
            meter.record(Duration::from_millis(20));
        }
        assert!(!meter.is_low());
    }
}
