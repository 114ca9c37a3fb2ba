//! FFmpeg-backed video file decoder.
//!
//! Frames are decoded in order and converted to RGB24. The decoder is flushed
//! at end of file so trailing buffered frames are not lost.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};

use super::file::file_label;
use super::{FrameSource, SourceFrame};

pub(crate) struct FfmpegVideoSource {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    source_id: String,
    total_frames: Option<u64>,
    index: u64,
    eof_sent: bool,
}

// SAFETY: FFmpeg demuxer, decoder and scaler contexts are not thread-affine.
// The source is moved to the loop thread and never shared.
unsafe impl Send for FfmpegVideoSource {}

impl FfmpegVideoSource {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open video {}", path.display()))?;
        let (stream_index, parameters, frames) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| anyhow!("{} has no video track", path.display()))?;
            (stream.index(), stream.parameters(), stream.frames())
        };
        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .context("load video decoder parameters")?
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "video {}: {}x{}, {} frame(s)",
            path.display(),
            decoder.width(),
            decoder.height(),
            if frames > 0 { frames.to_string() } else { "unknown".to_string() }
        );

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            source_id: file_label(path),
            total_frames: u64::try_from(frames).ok().filter(|n| *n > 0),
            index: 0,
            eof_sent: false,
        })
    }

    fn emit(&mut self, decoded: &ffmpeg::frame::Video) -> Result<SourceFrame> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .context("scale frame to RGB")?;
        self.index += 1;
        Ok(SourceFrame {
            image: DynamicImage::ImageRgb8(frame_to_image(&rgb)?),
            index: self.index,
            frame_time: Utc::now(),
            source_id: self.source_id.clone(),
        })
    }
}

impl FrameSource for FfmpegVideoSource {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.emit(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }
            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn frames_hint(&self) -> Option<u64> {
        self.total_frames
            .map(|total| total.saturating_sub(self.index))
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its size")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("decoded frame does not match {}x{}", width, height))
}
