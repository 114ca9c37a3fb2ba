//! Letterbox transform between source frames and the detector's square input.
//!
//! The forward transform scales the frame so its longer side equals the
//! target size `T`, then centers it on a black `T x T` canvas. Boxes reported
//! by the detector live on that canvas; [`Letterbox::to_source`] removes the
//! padding before undoing the scale, so it is exact for any aspect ratio.

use anyhow::Result;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::{BoundingBox, InvalidInput};

/// Per-frame letterbox geometry. Not persisted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    src_w: u32,
    src_h: u32,
    target: u32,
    resized_w: u32,
    resized_h: u32,
    pad_left: u32,
    pad_top: u32,
    pad_right: u32,
    pad_bottom: u32,
}

impl Letterbox {
    /// Derive the transform for a `src_h x src_w` frame and a `target` square.
    pub fn new(src_h: u32, src_w: u32, target: u32) -> Result<Self> {
        if src_h == 0 || src_w == 0 {
            return Err(InvalidInput::new(format!(
                "frame dimensions must be non-zero (got {}x{})",
                src_w, src_h
            ))
            .into());
        }
        if target == 0 {
            return Err(InvalidInput::new("letterbox target size must be positive").into());
        }

        let scale = target as f64 / src_h.max(src_w) as f64;
        let resized_w = ((src_w as f64 * scale).round() as u32).clamp(1, target);
        let resized_h = ((src_h as f64 * scale).round() as u32).clamp(1, target);

        let delta_w = target - resized_w;
        let delta_h = target - resized_h;
        let pad_left = delta_w / 2;
        let pad_top = delta_h / 2;

        Ok(Self {
            src_w,
            src_h,
            target,
            resized_w,
            resized_h,
            pad_left,
            pad_top,
            pad_right: delta_w - pad_left,
            pad_bottom: delta_h - pad_top,
        })
    }

    pub fn for_image(image: &DynamicImage, target: u32) -> Result<Self> {
        Self::new(image.height(), image.width(), target)
    }

    /// Nominal scale `T / max(H, W)`.
    pub fn scale(&self) -> f32 {
        self.target as f32 / self.src_h.max(self.src_w) as f32
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn source_dims(&self) -> (u32, u32) {
        (self.src_w, self.src_h)
    }

    pub fn resized_dims(&self) -> (u32, u32) {
        (self.resized_w, self.resized_h)
    }

    /// `(left, top, right, bottom)` padding in canvas pixels.
    pub fn padding(&self) -> (u32, u32, u32, u32) {
        (self.pad_left, self.pad_top, self.pad_right, self.pad_bottom)
    }

    // Effective per-axis scale after rounding the resized dimensions.
    fn axis_scale(&self) -> (f32, f32) {
        (
            self.resized_w as f32 / self.src_w as f32,
            self.resized_h as f32 / self.src_h as f32,
        )
    }

    /// Produce the padded `T x T` detector input.
    pub fn apply(&self, image: &DynamicImage) -> Result<RgbImage> {
        if image.width() != self.src_w || image.height() != self.src_h {
            return Err(InvalidInput::new(format!(
                "frame is {}x{}, letterbox was derived for {}x{}",
                image.width(),
                image.height(),
                self.src_w,
                self.src_h
            ))
            .into());
        }

        let rgb = image.to_rgb8();
        let resized = if (self.resized_w, self.resized_h) == (self.src_w, self.src_h) {
            rgb
        } else {
            image::imageops::resize(&rgb, self.resized_w, self.resized_h, FilterType::Triangle)
        };

        let mut canvas = RgbImage::new(self.target, self.target);
        image::imageops::overlay(
            &mut canvas,
            &resized,
            self.pad_left as i64,
            self.pad_top as i64,
        );
        Ok(canvas)
    }

    /// Map a detector-space box back onto the source frame, clamped to
    /// `[0, W] x [0, H]`.
    pub fn to_source(&self, bbox: &BoundingBox) -> BoundingBox {
        let (sx, sy) = self.axis_scale();
        let left = self.pad_left as f32;
        let top = self.pad_top as f32;
        BoundingBox {
            x1: (bbox.x1 - left) / sx,
            y1: (bbox.y1 - top) / sy,
            x2: (bbox.x2 - left) / sx,
            y2: (bbox.y2 - top) / sy,
        }
        .clamp_to(self.src_w as f32, self.src_h as f32)
    }

    /// Map a source-frame box onto the detector canvas.
    pub fn to_detector(&self, bbox: &BoundingBox) -> BoundingBox {
        let (sx, sy) = self.axis_scale();
        let left = self.pad_left as f32;
        let top = self.pad_top as f32;
        BoundingBox {
            x1: bbox.x1 * sx + left,
            y1: bbox.y1 * sy + top,
            x2: bbox.x2 * sx + left,
            y2: bbox.y2 * sy + top,
        }
    }
}

/// Scale-only remap from a stretched `T x T` input back to `W x H`.
///
/// Only exact when the source is square or the detector input was stretched
/// rather than letterboxed. Use [`Letterbox::to_source`] for letterboxed input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleRemap {
    pub scale_x: f32,
    pub scale_y: f32,
    src_w: u32,
    src_h: u32,
}

impl ScaleRemap {
    pub fn new(src_h: u32, src_w: u32, target: u32) -> Result<Self> {
        if src_h == 0 || src_w == 0 || target == 0 {
            return Err(InvalidInput::new(format!(
                "scale remap needs non-zero dimensions (source {}x{}, target {})",
                src_w, src_h, target
            ))
            .into());
        }
        Ok(Self {
            scale_x: src_w as f32 / target as f32,
            scale_y: src_h as f32 / target as f32,
            src_w,
            src_h,
        })
    }

    pub fn apply(&self, bbox: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x1: bbox.x1 * self.scale_x,
            y1: bbox.y1 * self.scale_y,
            x2: bbox.x2 * self.scale_x,
            y2: bbox.y2 * self.scale_y,
        }
        .clamp_to(self.src_w as f32, self.src_h as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_invalid_input;
    use image::Rgb;

    fn assert_close(a: &BoundingBox, b: &BoundingBox, tol: f32) {
        for (x, y) in [(a.x1, b.x1), (a.y1, b.y1), (a.x2, b.x2), (a.y2, b.y2)] {
            assert!((x - y).abs() <= tol, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn rejects_zero_dimensions_and_target() {
        assert!(is_invalid_input(&Letterbox::new(0, 10, 800).unwrap_err()));
        assert!(is_invalid_input(&Letterbox::new(10, 0, 800).unwrap_err()));
        assert!(is_invalid_input(&Letterbox::new(10, 10, 0).unwrap_err()));
        assert!(is_invalid_input(&ScaleRemap::new(10, 10, 0).unwrap_err()));
    }

    #[test]
    fn landscape_padding_is_split_top_bottom() {
        // 400 wide, 200 high into 800: scale 2, resized 800x400, 400 rows of pad.
        let lb = Letterbox::new(200, 400, 800).unwrap();
        assert_eq!(lb.scale(), 2.0);
        assert_eq!(lb.resized_dims(), (800, 400));
        assert_eq!(lb.padding(), (0, 200, 0, 200));
    }

    #[test]
    fn odd_padding_puts_extra_pixel_after() {
        // 4 wide, 3 high into 5: resized 5x4, the single padding row goes to the bottom.
        let lb = Letterbox::new(3, 4, 5).unwrap();
        assert_eq!(lb.resized_dims(), (5, 4));
        assert_eq!(lb.padding(), (0, 0, 0, 1));
    }

    #[test]
    fn round_trip_non_square_sources_within_one_pixel() {
        let sources = [(200, 400), (480, 640), (1080, 1920), (1920, 1080), (37, 911), (600, 333)];
        for (h, w) in sources {
            let lb = Letterbox::new(h, w, 800).unwrap();
            let fw = w as f32;
            let fh = h as f32;
            let boxes = [
                BoundingBox::new(0.0, 0.0, fw, fh),
                BoundingBox::new(fw * 0.1, fh * 0.2, fw * 0.5, fh * 0.9),
                BoundingBox::new(fw * 0.75, fh * 0.01, fw * 0.99, fh * 0.3),
            ];
            for b in boxes {
                let back = lb.to_source(&lb.to_detector(&b));
                assert_close(&back, &b, 1.0);
            }
        }
    }

    #[test]
    fn square_source_of_target_size_is_identity() {
        let lb = Letterbox::new(800, 800, 800).unwrap();
        assert_eq!(lb.scale(), 1.0);
        assert_eq!(lb.padding(), (0, 0, 0, 0));
        let b = BoundingBox::new(12.0, 34.0, 560.0, 780.0);
        assert_close(&lb.to_source(&b), &b, 1e-4);
    }

    #[test]
    fn square_sources_agree_with_scale_only_remap() {
        for side in [64, 400, 800, 1234] {
            let lb = Letterbox::new(side, side, 800).unwrap();
            let naive = ScaleRemap::new(side, side, 800).unwrap();
            let b = BoundingBox::new(100.0, 200.0, 300.0, 700.0);
            assert_close(&lb.to_source(&b), &naive.apply(&b), 1.0);
        }
    }

    #[test]
    fn scale_only_remap_example() {
        // 400 wide x 200 high source, 800x800 detector frame.
        let remap = ScaleRemap::new(200, 400, 800).unwrap();
        assert_eq!(remap.scale_x, 0.5);
        assert_eq!(remap.scale_y, 0.25);
        let out = remap.apply(&BoundingBox::new(10.0, 10.0, 50.0, 50.0));
        assert_eq!(out, BoundingBox::new(5.0, 2.5, 25.0, 12.5));
    }

    #[test]
    fn scale_only_remap_drifts_for_letterboxed_input() {
        let lb = Letterbox::new(200, 400, 800).unwrap();
        let naive = ScaleRemap::new(200, 400, 800).unwrap();
        let src = BoundingBox::new(100.0, 50.0, 200.0, 150.0);
        let det = lb.to_detector(&src);
        assert_close(&lb.to_source(&det), &src, 1.0);
        assert!((naive.apply(&det).y1 - src.y1).abs() > 10.0);
    }

    #[test]
    fn padding_region_clamps_to_frame() {
        let lb = Letterbox::new(200, 400, 800).unwrap();
        // Box entirely inside the top padding band.
        let out = lb.to_source(&BoundingBox::new(10.0, 10.0, 50.0, 50.0));
        assert_eq!(out.y1, 0.0);
        assert_eq!(out.y2, 0.0);
        assert!(out.is_degenerate());
        let out = lb.to_source(&BoundingBox::new(-20.0, 790.0, 900.0, 900.0));
        assert_eq!(out, BoundingBox::new(0.0, 200.0, 400.0, 200.0));
    }

    #[test]
    fn zero_area_box_passes_through() {
        let lb = Letterbox::new(800, 800, 800).unwrap();
        let b = BoundingBox::new(40.0, 40.0, 40.0, 40.0);
        assert_eq!(lb.to_source(&b), b);
    }

    #[test]
    fn apply_centers_image_on_black_canvas() {
        let mut img = RgbImage::new(4, 2);
        for p in img.pixels_mut() {
            *p = Rgb([255, 255, 255]);
        }
        let img = DynamicImage::ImageRgb8(img);
        let lb = Letterbox::for_image(&img, 8).unwrap();
        let canvas = lb.apply(&img).unwrap();
        assert_eq!(canvas.dimensions(), (8, 8));
        // rows 0..2 and 6..8 are padding
        assert_eq!(canvas.get_pixel(4, 0), &Rgb([0, 0, 0]));
        assert_eq!(canvas.get_pixel(4, 7), &Rgb([0, 0, 0]));
        assert_eq!(canvas.get_pixel(4, 4), &Rgb([255, 255, 255]));
    }

    #[test]
    fn apply_rejects_mismatched_frame() {
        let lb = Letterbox::new(10, 10, 8).unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::new(12, 10));
        assert!(lb.apply(&img).is_err());
    }
}
