use std::path::Path;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::Detection;

pub const ALERT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const OTHER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const THICKNESS: i32 = 2;

/// Draw each detection's box onto `image`, red for `alert_class` and green
/// for everything else. Boxes are in source pixel coordinates.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection], alert_class: &str) {
    for det in detections {
        let color = if det.is_class(alert_class) {
            ALERT_COLOR
        } else {
            OTHER_COLOR
        };
        let bbox = det.bbox().clamp_to(image.width() as f32, image.height() as f32);
        for inset in 0..THICKNESS {
            let x = bbox.x1.round() as i32 + inset;
            let y = bbox.y1.round() as i32 + inset;
            let w = bbox.width().round() as i32 - 2 * inset;
            let h = bbox.height().round() as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(image, Rect::at(x, y).of_size(w as u32, h as u32), color);
        }
    }
}

pub fn save_annotated(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("failed to write annotated image {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn det(label: &str, bbox: BoundingBox) -> Detection {
        Detection::new(label, 0.9, bbox, None, "cam").unwrap()
    }

    #[test]
    fn colors_follow_alert_class() {
        let mut img = RgbImage::new(64, 64);
        let dets = vec![
            det("Violence", BoundingBox::new(4.0, 4.0, 20.0, 20.0)),
            det("Non-Violence", BoundingBox::new(30.0, 30.0, 60.0, 60.0)),
        ];
        draw_detections(&mut img, &dets, "violence");
        assert_eq!(*img.get_pixel(4, 10), ALERT_COLOR);
        assert_eq!(*img.get_pixel(5, 10), ALERT_COLOR);
        assert_eq!(*img.get_pixel(30, 40), OTHER_COLOR);
        // interior untouched
        assert_eq!(*img.get_pixel(12, 12), Rgb([0, 0, 0]));
    }

    #[test]
    fn degenerate_and_out_of_frame_boxes_are_safe() {
        let mut img = RgbImage::new(16, 16);
        let dets = vec![
            det("Violence", BoundingBox::new(5.0, 5.0, 5.0, 5.0)),
            det("Violence", BoundingBox::new(-10.0, -10.0, 100.0, 100.0)),
        ];
        draw_detections(&mut img, &dets, "violence");
        assert_eq!(*img.get_pixel(0, 0), ALERT_COLOR);
    }
}
