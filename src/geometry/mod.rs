//! Geometry utilities: SE3 transforms, pinhole camera, triangulation, plane fitting.

pub mod camera;
pub mod plane;
pub mod se3;
pub mod triangulation;

pub use camera::CameraModel;
pub use plane::{fit_plane_least_squares, fit_plane_ransac, Plane, PlaneFit, PlaneRansacConfig};
pub use se3::SE3;
pub use triangulation::{parallax_cos, triangulate_dlt};
