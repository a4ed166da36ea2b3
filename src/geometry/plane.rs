//! Robust plane fitting for fixing the world frame on the ground plane.

use nalgebra::{Matrix3, Vector3};
use rand::prelude::*;

/// Plane `normal · p + offset = 0` with a unit normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vector3<f64>,
    pub offset: f64,
}

impl Plane {
    /// Plane through three points. None when they are (nearly) collinear.
    pub fn from_points(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> Option<Self> {
        let n = (b - a).cross(&(c - a));
        let norm = n.norm();
        if norm < 1e-12 {
            return None;
        }
        let normal = n / norm;
        Some(Self {
            normal,
            offset: -normal.dot(a),
        })
    }

    pub fn signed_distance(&self, p: &Vector3<f64>) -> f64 {
        self.normal.dot(p) + self.offset
    }

    /// Flip the plane so that `p` lies on its positive side.
    pub fn oriented_towards(self, p: &Vector3<f64>) -> Self {
        if self.signed_distance(p) < 0.0 {
            Self {
                normal: -self.normal,
                offset: -self.offset,
            }
        } else {
            self
        }
    }
}

/// Configuration for RANSAC plane estimation.
#[derive(Debug, Clone)]
pub struct PlaneRansacConfig {
    pub max_iterations: usize,
    /// Absolute inlier distance.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
}

/// Result of RANSAC plane estimation.
#[derive(Debug, Clone)]
pub struct PlaneFit {
    pub plane: Plane,
    pub inliers: Vec<usize>,
    pub centroid: Vector3<f64>,
}

impl PlaneFit {
    pub fn inlier_ratio(&self, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            self.inliers.len() as f64 / total as f64
        }
    }
}

/// Fit the dominant plane with RANSAC, then refit on the inliers.
///
/// Returns None if fewer than `min_inliers` points support any hypothesis.
pub fn fit_plane_ransac(points: &[Vector3<f64>], config: &PlaneRansacConfig) -> Option<PlaneFit> {
    let n = points.len();
    if n < 3 || n < config.min_inliers {
        return None;
    }

    let mut rng = thread_rng();
    let mut best: Option<(Plane, Vec<usize>)> = None;

    for _ in 0..config.max_iterations {
        let sample = rand::seq::index::sample(&mut rng, n, 3);
        let plane = match Plane::from_points(
            &points[sample.index(0)],
            &points[sample.index(1)],
            &points[sample.index(2)],
        ) {
            Some(p) => p,
            None => continue,
        };

        let inliers = find_inliers(points, &plane, config.inlier_threshold);
        let improved = best
            .as_ref()
            .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len());
        if improved {
            let done = inliers.len() == n;
            best = Some((plane, inliers));
            if done {
                break;
            }
        }
    }

    let (_, inliers) = best?;
    if inliers.len() < config.min_inliers {
        return None;
    }

    let inlier_points: Vec<Vector3<f64>> = inliers.iter().map(|&i| points[i]).collect();
    let (plane, centroid) = fit_plane_least_squares(&inlier_points)?;
    let inliers = find_inliers(points, &plane, config.inlier_threshold);
    if inliers.len() < config.min_inliers {
        return None;
    }

    Some(PlaneFit {
        plane,
        inliers,
        centroid,
    })
}

/// Total least-squares plane through a point set.
///
/// The normal is the eigenvector of the scatter matrix with the smallest
/// eigenvalue. Returns the plane and the centroid of the points.
pub fn fit_plane_least_squares(points: &[Vector3<f64>]) -> Option<(Plane, Vector3<f64>)> {
    if points.len() < 3 {
        return None;
    }

    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / points.len() as f64;
    let mut scatter = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        scatter += d * d.transpose();
    }

    let eigen = scatter.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let normal: Vector3<f64> = eigen.eigenvectors.column(min_idx).into_owned();
    let norm = normal.norm();
    if !norm.is_finite() || norm < 1e-12 {
        return None;
    }
    let normal = normal / norm;

    Some((
        Plane {
            normal,
            offset: -normal.dot(&centroid),
        },
        centroid,
    ))
}

fn find_inliers(points: &[Vector3<f64>], plane: &Plane, threshold: f64) -> Vec<usize> {
    points
        .iter()
        .enumerate()
        .filter(|(_, p)| plane.signed_distance(p).abs() <= threshold)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PlaneRansacConfig {
        PlaneRansacConfig {
            max_iterations: 200,
            inlier_threshold: 0.01,
            min_inliers: 10,
        }
    }

    fn tilted_plane_points() -> Vec<Vector3<f64>> {
        // z = 0.1 x - 0.2 y + 3
        let mut points = Vec::new();
        for i in 0..8 {
            for j in 0..8 {
                let x = i as f64 * 0.25 - 1.0;
                let y = j as f64 * 0.25 - 1.0;
                points.push(Vector3::new(x, y, 0.1 * x - 0.2 * y + 3.0));
            }
        }
        points
    }

    #[test]
    fn test_least_squares_recovers_plane() {
        let points = tilted_plane_points();
        let (plane, _) = fit_plane_least_squares(&points).unwrap();
        for p in &points {
            assert!(plane.signed_distance(p).abs() < 1e-9);
        }
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let mut points = tilted_plane_points();
        let n_plane = points.len();
        points.push(Vector3::new(0.0, 0.0, 10.0));
        points.push(Vector3::new(0.5, -0.5, -4.0));
        points.push(Vector3::new(1.0, 1.0, 7.0));

        let fit = fit_plane_ransac(&points, &config()).unwrap();
        assert_eq!(fit.inliers.len(), n_plane);
        assert!(fit.inliers.iter().all(|&i| i < n_plane));
    }

    #[test]
    fn test_ransac_degenerate_collinear() {
        let points: Vec<_> = (0..20).map(|i| Vector3::new(i as f64, 0.0, 0.0)).collect();
        assert!(fit_plane_ransac(&points, &config()).is_none());
    }

    #[test]
    fn test_orientation() {
        let plane = Plane {
            normal: Vector3::new(0.0, 0.0, 1.0),
            offset: 0.0,
        };
        let flipped = plane.oriented_towards(&Vector3::new(0.0, 0.0, -2.0));
        assert!(flipped.signed_distance(&Vector3::new(0.0, 0.0, -2.0)) > 0.0);
    }
}
