//! Grid-bucketed keypoint selection over a frame's own detections.

use crate::map::{Frame, KeyPoint};

use super::FeatureDetector;

/// Picks the strongest keypoint in each grid cell.
///
/// Frames arrive with their detections already attached, so this detector
/// only buckets them. It keeps the seeds spread over the whole image.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridDetector {
    /// Keypoints closer than this to the image border are ignored.
    pub border: f64,
}

impl GridDetector {
    pub fn new(border: f64) -> Self {
        Self { border }
    }
}

impl FeatureDetector for GridDetector {
    fn detect(&self, frame: &Frame, cell_size: u32) -> Vec<KeyPoint> {
        let camera = frame.camera();
        let cell = cell_size.max(1) as f64;
        let cols = (camera.width as f64 / cell).ceil().max(1.0) as usize;
        let rows = (camera.height as f64 / cell).ceil().max(1.0) as usize;

        let mut best: Vec<Option<&KeyPoint>> = vec![None; cols * rows];
        for kp in frame.keypoints() {
            if !camera.is_in_image(&kp.pt, self.border) {
                continue;
            }
            let c = ((kp.pt.x / cell) as usize).min(cols - 1);
            let r = ((kp.pt.y / cell) as usize).min(rows - 1);
            let slot = &mut best[r * cols + c];
            if slot.map_or(true, |b| kp.response > b.response) {
                *slot = Some(kp);
            }
        }

        best.into_iter().flatten().copied().collect()
    }
}
