//! Local image files as a frame source.
//!
//! Each file is one frame. Files are decoded lazily, in the given order
//! (directories are sorted by file name). Remote URLs are never fetched.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;

use super::{FrameSource, SourceFrame};
use crate::{sanitize_source_id, InvalidInput};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageFilesSource {
    pending: VecDeque<PathBuf>,
    source_id: String,
    index: u64,
}

impl ImageFilesSource {
    pub fn new(paths: Vec<PathBuf>) -> Result<Self> {
        if paths.is_empty() {
            return Err(anyhow!("no image files given"));
        }
        let source_id = if paths.len() == 1 {
            file_label(&paths[0])
        } else {
            "upload".to_string()
        };
        Ok(Self {
            pending: paths.into(),
            source_id,
            index: 0,
        })
    }

    /// Every `.jpg`, `.jpeg` and `.png` directly inside `dir`, sorted.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read image directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && has_image_extension(&path) {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(anyhow!("no images found in {}", dir.display()));
        }
        paths.sort();
        let mut source = Self::new(paths)?;
        source.source_id = file_label(dir);
        Ok(source)
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for ImageFilesSource {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.index += 1;

        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to read image {}", path.display()))?;
        let image = image::load_from_memory(&bytes).map_err(|e| {
            anyhow::Error::new(InvalidInput::new(format!(
                "{} is not a decodable image: {}",
                path.display(),
                e
            )))
        })?;
        if image.width() == 0 || image.height() == 0 {
            return Err(InvalidInput::new(format!("{} has zero size", path.display())).into());
        }

        Ok(Some(SourceFrame {
            image,
            index: self.index,
            frame_time: Utc::now(),
            source_id: file_label(&path),
        }))
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn frames_hint(&self) -> Option<u64> {
        Some(self.remaining() as u64)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub(super) fn file_label(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    sanitize_source_id(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_invalid_input;
    use image::{Rgb, RgbImage};

    #[test]
    fn directory_is_read_in_name_order_and_bad_files_are_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(4, 8, Rgb([1, 2, 3]))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("c.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = ImageFilesSource::from_dir(dir.path()).unwrap();
        assert_eq!(source.remaining(), 3);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.source_id, "a.png");
        assert_eq!((first.image.width(), first.image.height()), (4, 8));
        assert_eq!(first.index, 1);

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.source_id, "b.png");

        let err = source.next_frame().unwrap_err();
        assert!(is_invalid_input(&err));

        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(ImageFilesSource::new(Vec::new()).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageFilesSource::from_dir(dir.path()).is_err());
    }
}
