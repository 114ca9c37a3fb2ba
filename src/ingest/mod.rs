//! Frame sources.
//!
//! - `ImageFilesSource`: uploaded images or an image directory, in order
//! - video files (feature: ingest-file-ffmpeg), decoded frame by frame
//! - `SyntheticSource`: `stub://<name>` generated feed for demos and tests
//!
//! A source yields decoded frames one at a time; the pipeline never asks for
//! the next frame before the current one is fully processed. A per-item
//! decode failure is returned as an [`crate::InvalidInput`] error and the
//! caller moves on to the next item.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::DynamicImage;

pub mod file;
pub mod synthetic;
pub mod video;
#[cfg(feature = "ingest-file-ffmpeg")]
mod video_ffmpeg;

pub use file::ImageFilesSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use video::{is_video_path, open_video};

/// One decoded frame and where it came from.
#[derive(Clone, Debug)]
pub struct SourceFrame {
    pub image: DynamicImage,
    /// 1-based position in the stream, counting frames that failed to decode.
    pub index: u64,
    pub frame_time: DateTime<Utc>,
    /// File name or feed id recorded on each detection.
    pub source_id: String,
}

pub trait FrameSource: Send {
    /// `Ok(None)` at end of stream. An `Err` covers only the current item.
    fn next_frame(&mut self) -> Result<Option<SourceFrame>>;

    fn source_id(&self) -> &str;

    /// Live feeds never end on their own and are subject to FPS warnings.
    fn is_live(&self) -> bool {
        false
    }

    /// Consecutive frames of one video or feed. The frame stride only thins
    /// streams; every item of an image batch is processed.
    fn is_stream(&self) -> bool {
        self.is_live()
    }

    /// Frames still to come, when the source knows.
    fn frames_hint(&self) -> Option<u64> {
        None
    }
}

/// Tags every frame of an inner source with a fixed source id (camera name).
pub struct RelabelledSource {
    inner: Box<dyn FrameSource>,
    source_id: String,
}

impl RelabelledSource {
    pub fn new(inner: Box<dyn FrameSource>, source_id: &str) -> Result<Self> {
        crate::validate_source_id(source_id)?;
        Ok(Self {
            inner,
            source_id: source_id.to_lowercase(),
        })
    }
}

impl FrameSource for RelabelledSource {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        Ok(self.inner.next_frame()?.map(|mut frame| {
            frame.source_id = self.source_id.clone();
            frame
        }))
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_live(&self) -> bool {
        self.inner.is_live()
    }

    fn is_stream(&self) -> bool {
        self.inner.is_stream()
    }

    fn frames_hint(&self) -> Option<u64> {
        self.inner.frames_hint()
    }
}

/// Open a source from a URI: `stub://<name>` for a synthetic feed, anything
/// else is a local video file, image file or image directory.
pub fn open_source(uri: &str, synthetic: SyntheticConfig) -> Result<Box<dyn FrameSource>> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(anyhow!("frame source must not be empty"));
    }
    if let Some(name) = uri.strip_prefix("stub://") {
        return Ok(Box::new(SyntheticSource::new(name, synthetic)?));
    }
    if uri.contains("://") {
        return Err(anyhow!(
            "unsupported source '{}': only local paths and stub:// feeds are supported",
            uri
        ));
    }
    let path = PathBuf::from(uri);
    if is_video_path(&path) {
        return open_video(&path);
    }
    if path.is_dir() {
        ImageFilesSource::from_dir(&path).map(|s| Box::new(s) as Box<dyn FrameSource>)
    } else {
        ImageFilesSource::new(vec![path]).map(|s| Box::new(s) as Box<dyn FrameSource>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_uri_opens_synthetic_feed() {
        let config = SyntheticConfig {
            frame_limit: Some(2),
            ..SyntheticConfig::default()
        };
        let mut source = open_source("stub://classroom", config).unwrap();
        assert_eq!(source.source_id(), "classroom");
        assert!(source.is_live());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn relabelled_source_overrides_frame_ids() {
        let config = SyntheticConfig {
            width: 8,
            height: 8,
            frame_limit: Some(1),
            ..SyntheticConfig::default()
        };
        let inner = open_source("stub://feed", config).unwrap();
        let mut source = RelabelledSource::new(inner, "Camera:Hall_2").unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.source_id, "camera:hall_2");
        assert!(source.next_frame().unwrap().is_none());
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn video_files_need_the_ffmpeg_feature() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("recess.MP4");
        std::fs::write(&clip, b"not really a video").unwrap();
        let err = open_source(clip.to_str().unwrap(), SyntheticConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("ingest-file-ffmpeg"), "{}", err);
    }

    #[test]
    fn remote_schemes_are_rejected() {
        assert!(open_source("rtsp://10.0.0.2/stream", SyntheticConfig::default()).is_err());
        assert!(open_source("  ", SyntheticConfig::default()).is_err());
    }
}
