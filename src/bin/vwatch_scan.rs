//! vwatch_scan - batch detection over image and video files
//!
//! Prints one JSON line per processed image or video frame. Undecodable files
//! are reported and skipped. The frame stride thins video frames only.
//! Optionally writes annotated copies and the session log as CSV.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use violence_watch::analytics::to_csv;
use violence_watch::annotate::save_annotated;
use violence_watch::config::WatchConfig;
use violence_watch::ingest::{is_video_path, open_video};
use violence_watch::ui::Ui;
use violence_watch::{
    AlertDispatcher, DetectionPipeline, Detection, FrameSource, ImageFilesSource, LogAlertSink,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image files, video files or directories of images.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Override the detection confidence threshold.
    #[arg(long)]
    conf: Option<f32>,
    /// Write annotated copies into this directory.
    #[arg(long)]
    annotate_dir: Option<PathBuf>,
    /// Write the detection log as CSV.
    #[arg(long)]
    csv: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Serialize)]
struct ScanLine<'a> {
    file: &'a str,
    detections: &'a [Detection],
    alerts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    elapsed_ms: u128,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::from_flag(&args.ui);

    let cfg = WatchConfig::load()?;
    let mut session = cfg.session();
    if let Some(conf) = args.conf {
        session.detect.confidence = conf;
        session.alert.threshold = conf;
    }
    session.annotate = args.annotate_dir.is_some();

    if let Some(dir) = &args.annotate_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let (backend, classes) = {
        let _stage = ui.stage("Load detector");
        cfg.build_detector()?
    };
    let mut pipeline = DetectionPipeline::new(session, backend, classes)?;
    if cfg.alerts.enabled {
        pipeline =
            pipeline.with_dispatcher(AlertDispatcher::spawn(LogAlertSink, cfg.alerts.queue_capacity)?);
    }

    let mut sources: Vec<Box<dyn FrameSource>> = Vec::new();
    for input in &args.inputs {
        let source: Box<dyn FrameSource> = if input.is_dir() {
            Box::new(ImageFilesSource::from_dir(input)?)
        } else if is_video_path(input) {
            open_video(input)?
        } else {
            Box::new(ImageFilesSource::new(vec![input.clone()])?)
        };
        sources.push(source);
    }
    let total: u64 = sources.iter().filter_map(|s| s.frames_hint()).sum();
    let progress = ui.progress(total, "scan");

    let stop = AtomicBool::new(false);
    let annotate_dir = args.annotate_dir.clone();
    let mut write_errors = Vec::new();
    let mut written = 0u64;
    for source in sources.iter_mut() {
        pipeline.run_source_with(source.as_mut(), &stop, |report| {
            let line = ScanLine {
                file: &report.source_id,
                detections: &report.detections,
                alerts: report.alert_count(),
                error: report.detector_error.as_deref(),
                elapsed_ms: report.elapsed.as_millis(),
            };
            match serde_json::to_string(&line) {
                Ok(json) => println!("{}", json),
                Err(e) => write_errors.push(anyhow!("failed to encode result: {}", e)),
            }
            if let (Some(dir), Some(image)) = (annotate_dir.as_deref(), report.annotated.as_ref()) {
                written += 1;
                let path = annotated_path(dir, &report.source_id, written);
                if let Err(e) = save_annotated(image, &path) {
                    write_errors.push(e);
                }
            }
            progress.advance(&report.source_id, report.alert_count());
        });
    }
    progress.finish();

    for e in &write_errors {
        log::error!("{:#}", e);
    }

    if let Some(csv_path) = &args.csv {
        std::fs::write(csv_path, to_csv(pipeline.log().get_all()))
            .with_context(|| format!("failed to write {}", csv_path.display()))?;
        eprintln!("wrote {}", csv_path.display());
    }

    let summary = pipeline.summary()?;
    let stats = pipeline.shutdown()?;
    eprintln!(
        "scanned {} image(s): {} detection(s), {} alert(s), {} skipped as invalid, {} detector failure(s); violence={} other={}",
        stats.frames_processed,
        stats.detections,
        stats.alerts,
        stats.invalid_inputs,
        stats.detector_failures,
        summary.alert_class_count,
        summary.other_count
    );
    if !write_errors.is_empty() {
        return Err(anyhow!("{} output file(s) could not be written", write_errors.len()));
    }
    Ok(())
}

/// Numbered so frames of one video do not overwrite each other.
fn annotated_path(dir: &Path, source_id: &str, seq: u64) -> PathBuf {
    let stem = Path::new(source_id)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("frame");
    dir.join(format!("{:05}_{}_annotated.png", seq, stem))
}
