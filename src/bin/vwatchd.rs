//! vwatchd - violence-watch monitoring daemon
//!
//! This daemon:
//! 1. Loads configuration (file, defaults, environment)
//! 2. Builds the detector and checks the alert class is in its class table
//! 3. Reads frames from the configured source until it ends or Ctrl-C
//! 4. Logs, persists and (optionally) publishes violence alerts
//! 5. Enforces retention on the detection store in the background

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use violence_watch::config::WatchConfig;
use violence_watch::ingest::{open_source, RelabelledSource, SyntheticConfig};
use violence_watch::transport::MqttAlertSink;
use violence_watch::ui::Ui;
use violence_watch::{
    AlertDispatcher, DetectionPipeline, DetectionStore, FrameSource, LogAlertSink,
    SqliteDetectionStore,
};

const RETENTION_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stop after this many frames (synthetic feeds only).
    #[arg(long, env = "VWATCH_MAX_FRAMES")]
    max_frames: Option<u64>,
    /// Skip the warm-up pass on a black frame.
    #[arg(long)]
    no_warm_up: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::from_flag(&args.ui);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        WatchConfig::load()?
    };

    let store = {
        let _stage = ui.stage("Open detection store");
        SqliteDetectionStore::open(&cfg.db_path)?
    };

    let (backend, classes) = {
        let _stage = ui.stage("Load detector");
        cfg.build_detector()?
    };
    log::info!(
        "detector classes: [{}], alert class '{}'",
        classes.names().join(", "),
        cfg.alerts.class
    );

    let mut pipeline =
        DetectionPipeline::new(cfg.session(), backend, classes)?.with_store(Box::new(store));

    if cfg.alerts.enabled {
        let dispatcher = match cfg.alerts.mqtt_broker.as_deref() {
            Some(broker) => {
                let _stage = ui.stage("Connect MQTT broker");
                let sink = MqttAlertSink::connect(broker, &cfg.alerts.mqtt_topic, "vwatchd")?;
                AlertDispatcher::spawn(sink, cfg.alerts.queue_capacity)?
            }
            None => AlertDispatcher::spawn(LogAlertSink, cfg.alerts.queue_capacity)?,
        };
        pipeline = pipeline.with_dispatcher(dispatcher);
    } else {
        log::info!("alert notifications disabled; alerts are still logged and stored");
    }

    if !args.no_warm_up {
        let _stage = ui.stage("Warm up detector");
        pipeline.warm_up()?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let synthetic = SyntheticConfig {
        frame_limit: args.max_frames,
        ..SyntheticConfig::default()
    };
    let mut source: Box<dyn FrameSource> = open_source(&cfg.source, synthetic)?;
    if let Some(source_id) = cfg.source_id.as_deref() {
        source = Box::new(RelabelledSource::new(source, source_id)?);
    }

    let retention = spawn_retention(&cfg, stop.clone())?;

    log::info!(
        "vwatchd running. source={} stride={} db={}",
        cfg.source,
        cfg.frame_stride,
        cfg.db_path
    );
    let started = Instant::now();
    let mut alert_count = 0u64;
    pipeline.run_source_with(source.as_mut(), &stop, |report| {
        for alert in &report.alerts {
            alert_count += 1;
            log::info!(
                "alert #{}: {} {} conf={:.2} severity={}",
                alert_count,
                alert.source,
                alert.label,
                alert.confidence,
                alert.severity.as_str()
            );
        }
        if let Some(t) = report.truncation {
            log::info!("log truncated: dropped {}, kept {}", t.dropped, t.kept);
        }
    });

    stop.store(true, Ordering::SeqCst);
    if retention.join().is_err() {
        log::error!("retention thread panicked");
    }

    let summary = pipeline.summary()?;
    let stats = pipeline.shutdown()?;
    log::info!(
        "vwatchd stopped after {:.1}s: processed={} skipped={} invalid={} detector_failures={} alerts={} dropped_notifications={}",
        started.elapsed().as_secs_f64(),
        stats.frames_processed,
        stats.frames_skipped,
        stats.invalid_inputs,
        stats.detector_failures,
        stats.alerts,
        stats.notifications_dropped
    );
    log::info!(
        "log summary: {} violence / {} other, avg confidence {}",
        summary.alert_class_count,
        summary.other_count,
        summary
            .average_confidence
            .map(|c| format!("{:.2}", c))
            .unwrap_or_else(|| "n/a".to_string())
    );
    Ok(())
}

/// Prune old rows on a second SQLite connection until `stop` is set.
fn spawn_retention(
    cfg: &WatchConfig,
    stop: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    let mut store = SqliteDetectionStore::open(&cfg.db_path)?;
    let retention = cfg.retention;
    std::thread::Builder::new()
        .name("retention".to_string())
        .spawn(move || {
            let mut last_prune: Option<Instant> = None;
            while !stop.load(Ordering::SeqCst) {
                if last_prune.map_or(true, |t| t.elapsed() >= RETENTION_INTERVAL) {
                    match store.enforce_retention(retention) {
                        Ok(0) => {}
                        Ok(removed) => log::info!("retention removed {} rows", removed),
                        Err(e) => log::error!("retention failed: {:#}", e),
                    }
                    last_prune = Some(Instant::now());
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        })
        .map_err(|e| anyhow!("failed to spawn retention thread: {}", e))
}
