//! Pinhole camera model for monocular frames.

use nalgebra::{Vector2, Vector3};
use serde::Deserialize;

/// Pinhole intrinsics plus the image size the keypoints live in.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Project a camera-frame point. Returns None behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 1e-6 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Unit bearing vector through a pixel.
    pub fn bearing(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        self.normalized(uv).normalize()
    }

    /// Normalized image coordinates `(x, y, 1)`.
    pub fn normalized(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new((uv.x - self.cx) / self.fx, (uv.y - self.cy) / self.fy, 1.0)
    }

    pub fn is_in_image(&self, uv: &Vector2<f64>, margin: f64) -> bool {
        uv.x >= margin
            && uv.y >= margin
            && uv.x < self.width as f64 - margin
            && uv.y < self.height as f64 - margin
    }
}
