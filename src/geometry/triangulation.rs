//! Two-view triangulation primitives.

use nalgebra::{Matrix3x4, Matrix4, Vector3};

use super::SE3;

/// Triangulate a point from two normalized observations using DLT.
///
/// `xn1`/`xn2` are normalized image coordinates `(x, y, 1)` and
/// `pose1`/`pose2` are camera-to-world transforms.
pub fn triangulate_dlt(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    pose1: &SE3,
    pose2: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(&pose1.inverse());
    let p2 = projection_matrix(&pose2.inverse());

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    // Right singular vector of the smallest singular value.
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x_h = v_t.row(min_idx);

    if x_h[3].abs() < 1e-10 {
        return None;
    }

    let p = Vector3::new(x_h[0] / x_h[3], x_h[1] / x_h[3], x_h[2] / x_h[3]);
    p.iter().all(|v| v.is_finite()).then_some(p)
}

/// Cosine of the parallax angle between two viewing rays, both in world
/// orientation.
pub fn parallax_cos(ray1: &Vector3<f64>, ray2: &Vector3<f64>) -> f64 {
    let denom = ray1.norm() * ray2.norm();
    if denom < 1e-12 {
        return 1.0;
    }
    ray1.dot(ray2) / denom
}

fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    let r = pose_cw.rotation_matrix();
    let t = pose_cw.translation;
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    p
}
