use super::result::RawDetection;

/// Greedy per-class non-maximum suppression.
///
/// Keeps detections in descending confidence order; a box is dropped when it
/// overlaps an already kept box of the same class by more than `iou_threshold`.
pub fn non_max_suppression(dets: &mut Vec<RawDetection>, iou_threshold: f32) {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..dets.len() {
        let suppressed = (0..kept).any(|prev| {
            dets[prev].class_index == dets[index].class_index
                && dets[prev].bbox.iou(&dets[index].bbox) > iou_threshold
        });
        if !suppressed {
            dets.swap(kept, index);
            kept += 1;
        }
    }
    dets.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    #[test]
    fn overlapping_same_class_boxes_collapse() {
        let mut dets = vec![
            RawDetection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1, 0.6),
            RawDetection::new(BoundingBox::new(1.0, 1.0, 10.0, 10.0), 1, 0.9),
            RawDetection::new(BoundingBox::new(50.0, 50.0, 60.0, 60.0), 1, 0.3),
        ];
        non_max_suppression(&mut dets, 0.5);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].confidence, 0.9);
        assert_eq!(dets[1].confidence, 0.3);
    }

    #[test]
    fn different_classes_are_not_suppressed() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let mut dets = vec![RawDetection::new(b, 0, 0.8), RawDetection::new(b, 1, 0.7)];
        non_max_suppression(&mut dets, 0.5);
        assert_eq!(dets.len(), 2);
    }
}
