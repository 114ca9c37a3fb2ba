use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::AlertPolicy;
use crate::classes::ClassTable;
use crate::detect::{BackendHandle, BackendRegistry, DetectParams, StubBackend};
use crate::pipeline::{FitMode, SessionConfig};

const DEFAULT_DB_PATH: &str = "vwatch.db";
const DEFAULT_SOURCE: &str = "stub://classroom";
const DEFAULT_FRAME_STRIDE: u64 = 1;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_TARGET_SIZE: u32 = 800;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.7;
const DEFAULT_MAX_DETECTIONS: usize = 300;
const DEFAULT_CLASSES: [&str; 2] = ["Non-Violence", "Violence"];
const DEFAULT_ALERT_CLASS: &str = "violence";
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_MQTT_TOPIC: &str = "vwatch/alerts";
const DEFAULT_MAX_LOG_SIZE: usize = 5000;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;

#[derive(Debug, Deserialize, Default)]
struct WatchConfigFile {
    db_path: Option<String>,
    source: Option<String>,
    source_id: Option<String>,
    frame_stride: Option<u64>,
    max_log_size: Option<usize>,
    detector: Option<DetectorConfigFile>,
    alerts: Option<AlertConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    target_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
    max_detections: Option<usize>,
    classes: Option<Vec<String>>,
    fit: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    class: Option<String>,
    threshold: Option<f32>,
    enabled: Option<bool>,
    queue_capacity: Option<usize>,
    mqtt_broker: Option<String>,
    mqtt_topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub db_path: String,
    pub source: String,
    /// Replaces the per-frame source id (camera name) when set.
    pub source_id: Option<String>,
    pub frame_stride: u64,
    pub max_log_size: usize,
    pub detector: DetectorSettings,
    pub alerts: AlertSettings,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub target_size: u32,
    pub confidence: f32,
    pub iou: f32,
    pub max_detections: usize,
    pub classes: Vec<String>,
    pub fit: FitMode,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub class: String,
    pub threshold: f32,
    pub enabled: bool,
    pub queue_capacity: usize,
    pub mqtt_broker: Option<String>,
    pub mqtt_topic: String,
}

impl WatchConfig {
    /// File (`VWATCH_CONFIG`), then defaults, then environment overrides,
    /// then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WatchConfigFile) -> Result<Self> {
        let detector = file.detector.unwrap_or_default();
        let alerts = file.alerts.unwrap_or_default();

        let confidence = detector.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        let fit = match detector.fit.as_deref() {
            Some(name) => parse_fit(name)?,
            None => FitMode::Letterbox,
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            source: file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            source_id: file.source_id,
            frame_stride: file.frame_stride.unwrap_or(DEFAULT_FRAME_STRIDE),
            max_log_size: file.max_log_size.unwrap_or(DEFAULT_MAX_LOG_SIZE),
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: detector.model_path,
                target_size: detector.target_size.unwrap_or(DEFAULT_TARGET_SIZE),
                confidence,
                iou: detector.iou.unwrap_or(DEFAULT_IOU),
                max_detections: detector.max_detections.unwrap_or(DEFAULT_MAX_DETECTIONS),
                classes: detector
                    .classes
                    .unwrap_or_else(|| DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect()),
                fit,
            },
            alerts: AlertSettings {
                class: alerts
                    .class
                    .unwrap_or_else(|| DEFAULT_ALERT_CLASS.to_string()),
                threshold: alerts.threshold.unwrap_or(confidence),
                enabled: alerts.enabled.unwrap_or(false),
                queue_capacity: alerts.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                mqtt_broker: alerts.mqtt_broker,
                mqtt_topic: alerts
                    .mqtt_topic
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            },
            retention: Duration::from_secs(
                file.retention
                    .and_then(|retention| retention.seconds)
                    .unwrap_or(DEFAULT_RETENTION_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("VWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(source) = env_nonempty("VWATCH_SOURCE") {
            self.source = source;
        }
        if let Some(source_id) = env_nonempty("VWATCH_SOURCE_ID") {
            self.source_id = Some(source_id);
        }
        if let Some(stride) = env_nonempty("VWATCH_FRAME_STRIDE") {
            self.frame_stride = stride
                .parse()
                .map_err(|_| anyhow!("VWATCH_FRAME_STRIDE must be a positive integer"))?;
        }
        if let Some(threshold) = env_nonempty("VWATCH_CONF_THRESHOLD") {
            let value: f32 = threshold
                .parse()
                .map_err(|_| anyhow!("VWATCH_CONF_THRESHOLD must be a number in 0..=1"))?;
            self.detector.confidence = value;
            self.alerts.threshold = value;
        }
        if let Some(enabled) = env_nonempty("VWATCH_ALERTS_ENABLED") {
            self.alerts.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("VWATCH_ALERTS_ENABLED must be true/false"))?;
        }
        if let Some(size) = env_nonempty("VWATCH_MAX_LOG_SIZE") {
            self.max_log_size = size
                .parse()
                .map_err(|_| anyhow!("VWATCH_MAX_LOG_SIZE must be a positive integer"))?;
        }
        if let Some(retention) = env_nonempty("VWATCH_RETENTION_SECS") {
            let seconds: u64 = retention.parse().map_err(|_| {
                anyhow!("VWATCH_RETENTION_SECS must be an integer number of seconds")
            })?;
            self.retention = Duration::from_secs(seconds);
        }
        if let Some(broker) = env_nonempty("VWATCH_MQTT_BROKER") {
            self.alerts.mqtt_broker = Some(broker);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(source_id) = self.source_id.as_mut() {
            crate::validate_source_id(source_id)?;
            *source_id = source_id.to_lowercase();
        }
        if self.source.trim().is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        if self.retention.as_secs() == 0 {
            return Err(anyhow!("retention must be greater than zero"));
        }
        if self.alerts.queue_capacity == 0 {
            return Err(anyhow!("alert queue capacity must be greater than zero"));
        }

        self.session().validate()?;
        let classes = ClassTable::from_names(self.detector.classes.clone())?;
        classes.require_class(&self.alerts.class)?;
        Ok(())
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            confidence: self.detector.confidence,
            iou: self.detector.iou,
            max_detections: self.detector.max_detections,
        }
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            target_class: self.alerts.class.trim().to_string(),
            threshold: self.alerts.threshold,
            enabled: self.alerts.enabled,
        }
    }

    /// Explicit per-session context handed to the pipeline.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            target_size: self.detector.target_size,
            detect: self.detect_params(),
            alert: self.alert_policy(),
            frame_stride: self.frame_stride,
            max_log_size: self.max_log_size,
            fit: self.detector.fit,
            annotate: false,
        }
    }

    /// Build the configured detector and the class table it reports with.
    /// A backend that carries its own class names overrides the configured
    /// list.
    pub fn build_detector(&self) -> Result<(BackendHandle, ClassTable)> {
        let configured = self.detector.classes.clone();
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new(configured.clone()));
        #[cfg(feature = "backend-tract")]
        if self.detector.backend == "tract" {
            let model_path = self
                .detector
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires detector.model_path"))?;
            registry.register(crate::detect::TractBackend::new(
                model_path,
                self.detector.target_size,
                configured.clone(),
            )?);
        }
        registry.set_default(&self.detector.backend).map_err(|_| {
            anyhow!(
                "unknown or disabled detector backend '{}' (available: {})",
                self.detector.backend,
                registry.list().join(", ")
            )
        })?;
        let backend = registry
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;

        let names = backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?
            .class_names()
            .filter(|names| !names.is_empty())
            .unwrap_or(configured);
        let classes = ClassTable::from_names(names)?;
        classes.require_class(&self.alerts.class)?;
        Ok((backend, classes))
    }
}

fn read_config_file(path: &Path) -> Result<WatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_fit(value: &str) -> Result<FitMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "letterbox" => Ok(FitMode::Letterbox),
        "stretch" => Ok(FitMode::Stretch),
        other => Err(anyhow!("detector.fit must be letterbox or stretch (got '{}')", other)),
    }
}

/// Split a comma-separated list, dropping empty entries.
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
