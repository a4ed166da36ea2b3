//! SE(3) rigid-body transform.

use std::ops::Mul;

use nalgebra::{Matrix3, Unit, UnitQuaternion, Vector3};

/// Rigid transform with a unit-quaternion rotation and a translation.
///
/// Frame poses are stored as `T_wc` (camera to world), so
/// `p_world = pose.transform_point(&p_cam)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix, re-orthonormalizing it.
    pub fn from_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_matrix(rotation);
        Self {
            rotation,
            translation,
        }
    }

    /// Build from an axis-angle vector (direction = axis, norm = angle).
    pub fn from_axis_angle(axis_angle: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        let angle = axis_angle.norm();
        let rotation = if angle > 1e-10 {
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(*axis_angle / angle), angle)
        } else {
            UnitQuaternion::identity()
        };
        Self {
            rotation,
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotate_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Rotation angle of `self^-1 * other` in radians.
    pub fn angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl Mul for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        *self * *rhs
    }
}
