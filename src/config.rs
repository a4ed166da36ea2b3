//! Construction-time configuration for the mapping backend.
//!
//! Every section has a `Default` carrying the tuned constants, and every
//! section deserializes with `#[serde(default)]` so a config file only needs
//! to name the values it overrides.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Top-level mapping configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Grid cell size (pixels) used to spread candidate seeds over the image.
    pub cell_size: u32,
    /// Maximum number of keyframes retained after an eviction pass.
    pub max_keyframes: usize,
    pub keyframes: KeyframeConfig,
    pub candidates: CandidateConfig,
    pub matcher: MatcherConfig,
    pub gauge: GaugeConfig,
    pub bundle: BundleConfig,
    pub worker: WorkerConfig,
}

/// Keyframe admission and covisibility policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyframeConfig {
    /// A new keyframe is needed when matches drop below this fraction of the
    /// reference keyframe's matches.
    pub min_match_ratio: f64,
    /// A new keyframe is needed when baseline / median depth to the nearest
    /// keyframe exceeds this ratio.
    pub min_baseline_ratio: f64,
    /// Keyframe pairs sharing more than this many points are connected.
    pub covisibility_threshold: usize,
}

/// Candidate lifecycle thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// Successful matches needed before a candidate is promoted.
    pub min_observations: u32,
    /// Failed matches after which a candidate is discarded.
    pub max_failures: u32,
    /// Seed depth when the seeding frame has no depth information.
    pub default_depth: f64,
}

/// Reference matcher thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Maximum Hamming distance between binary descriptors.
    pub max_descriptor_distance: u32,
    /// Projection search radius for converged points (pixels).
    pub search_radius: f64,
    /// Maximum distance of a keypoint to the epipolar segment (pixels).
    pub epipolar_tolerance: f64,
    /// Depth range searched along the reference ray, as multiples of the
    /// current depth estimate.
    pub min_depth_factor: f64,
    pub max_depth_factor: f64,
    /// Minimum parallax angle (radians) for a valid triangulation.
    pub min_parallax: f64,
    /// Maximum reprojection error (pixels) of a triangulated point.
    pub max_reprojection_error: f64,
    /// Border margin (pixels) for in-image checks.
    pub border: f64,
}

/// One-shot gauge fixing of the bootstrap map.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GaugeConfig {
    pub ransac_iterations: usize,
    /// Plane inlier distance as a fraction of the median point distance from
    /// the reference camera.
    pub inlier_threshold: f64,
    pub min_points: usize,
    pub min_inlier_ratio: f64,
    /// If set, the map is rescaled so the reference camera sits this high
    /// above the plane.
    pub camera_height: Option<f64>,
}

/// Local bundle adjustment window and solver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Maximum keyframes optimized together (pivot included).
    pub window_size: usize,
    pub max_iterations: usize,
    pub param_tolerance: f64,
    pub gradient_tolerance: f64,
    /// Huber kernel threshold (pixels).
    pub huber_threshold: f64,
    /// Minimum number of observations for a problem worth solving.
    pub min_observations: usize,
}

/// Worker loop timing and flow control.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound on how long the worker sleeps waiting for a frame.
    pub poll_interval_ms: u64,
    /// Queue length above which the frontend is told the map is backlogged.
    pub max_queue_len: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            cell_size: 30,
            max_keyframes: 20,
            keyframes: KeyframeConfig::default(),
            candidates: CandidateConfig::default(),
            matcher: MatcherConfig::default(),
            gauge: GaugeConfig::default(),
            bundle: BundleConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            min_match_ratio: 0.6,
            min_baseline_ratio: 0.12,
            covisibility_threshold: 10,
        }
    }
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            min_observations: 5,
            max_failures: 3,
            default_depth: 1.0,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_descriptor_distance: 50,
            search_radius: 15.0,
            epipolar_tolerance: 2.0,
            min_depth_factor: 0.25,
            max_depth_factor: 4.0,
            min_parallax: 1.0_f64.to_radians(),
            max_reprojection_error: 2.5,
            border: 4.0,
        }
    }
}

impl Default for GaugeConfig {
    fn default() -> Self {
        Self {
            ransac_iterations: 200,
            inlier_threshold: 0.02,
            min_points: 10,
            min_inlier_ratio: 0.6,
            camera_height: None,
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            max_iterations: 10,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            huber_threshold: 5.991_f64.sqrt(), // 95% chi2 with 2 DOF
            min_observations: 10,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            max_queue_len: 3,
        }
    }
}

impl MapConfig {
    /// Default configuration with the construction-time grid and window sizes.
    pub fn new(cell_size: u32, max_keyframes: usize) -> Self {
        Self {
            cell_size,
            max_keyframes,
            ..Self::default()
        }
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("failed to parse map config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read map config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("invalid map config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.cell_size > 0, "cell_size must be > 0");
        ensure!(self.max_keyframes >= 2, "max_keyframes must be >= 2, got {}", self.max_keyframes);
        ensure!(
            self.keyframes.min_match_ratio > 0.0 && self.keyframes.min_match_ratio <= 1.0,
            "keyframes.min_match_ratio must be in (0, 1], got {}",
            self.keyframes.min_match_ratio
        );
        ensure!(
            self.keyframes.min_baseline_ratio > 0.0,
            "keyframes.min_baseline_ratio must be > 0"
        );
        ensure!(
            self.candidates.min_observations > 0,
            "candidates.min_observations must be > 0"
        );
        ensure!(self.candidates.max_failures > 0, "candidates.max_failures must be > 0");
        ensure!(
            self.candidates.default_depth > 0.0,
            "candidates.default_depth must be > 0"
        );
        ensure!(
            self.matcher.min_depth_factor > 0.0
                && self.matcher.min_depth_factor < self.matcher.max_depth_factor,
            "matcher depth factors must satisfy 0 < min < max"
        );
        ensure!(self.gauge.min_points >= 3, "gauge.min_points must be >= 3");
        ensure!(
            self.gauge.min_inlier_ratio > 0.0 && self.gauge.min_inlier_ratio <= 1.0,
            "gauge.min_inlier_ratio must be in (0, 1]"
        );
        if let Some(h) = self.gauge.camera_height {
            ensure!(h > 0.0, "gauge.camera_height must be > 0, got {h}");
        }
        ensure!(self.bundle.window_size >= 2, "bundle.window_size must be >= 2");
        ensure!(self.worker.poll_interval_ms > 0, "worker.poll_interval_ms must be > 0");
        Ok(())
    }
}
