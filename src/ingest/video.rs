//! Uploaded video files.
//!
//! Decoding needs FFmpeg and is only built with the `ingest-file-ffmpeg`
//! feature. Without it a video path is rejected when the source is opened.

use std::path::Path;

#[cfg(not(feature = "ingest-file-ffmpeg"))]
use anyhow::anyhow;
use anyhow::Result;

use super::FrameSource;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "m4v", "webm"];

/// True for file names with a known video container extension.
pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Open a local video file as a frame stream.
pub fn open_video(path: &Path) -> Result<Box<dyn FrameSource>> {
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(super::video_ffmpeg::FfmpegVideoSource::open(path)?))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(anyhow!(
            "video input {} requires the ingest-file-ffmpeg feature",
            path.display()
        ))
    }
}
