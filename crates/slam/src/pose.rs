//! Rigid-body pose type used throughout the mapping backend.
//!
//! A keyframe or map point's pose is always expressed as the rigid
//! transform that carries a point from camera space into the fixed world
//! frame: `world_point = pose * camera_point`. Tracking, relocalization and
//! loop closing all produce and consume poses in this one convention, so
//! there is exactly one pose type instead of a frame graph to look up.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};

/// A 3D rigid body transform (rotation + translation), wrapping
/// [`nalgebra::Isometry3`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose3 {
    inner: Isometry3<f64>,
}

impl Pose3 {
    pub fn identity() -> Self {
        Self {
            inner: Isometry3::identity(),
        }
    }

    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            inner: Isometry3::from_parts(Translation3::from(translation), rotation),
        }
    }

    pub fn from_isometry(inner: Isometry3<f64>) -> Self {
        Self { inner }
    }

    pub fn as_isometry(&self) -> &Isometry3<f64> {
        &self.inner
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.inner.translation.vector
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.inner.rotation
    }

    /// Inverse transform: world space to camera space.
    pub fn inverse(&self) -> Self {
        Self {
            inner: self.inner.inverse(),
        }
    }

    /// Compose transforms: `self` applied after `other`, i.e. if `self` is
    /// B->C and `other` is A->B, the result is A->C.
    pub fn compose(&self, other: &Pose3) -> Pose3 {
        Pose3 {
            inner: self.inner * other.inner,
        }
    }

    /// Transform carries a point from this pose's local frame into the
    /// frame `self` is expressed in (typically camera frame -> world
    /// frame).
    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.inner.transform_point(p)
    }

    /// Transform a point from the frame `self` is expressed in back into
    /// this pose's local frame (world -> camera, the projection direction
    /// every reprojection check needs).
    pub fn inverse_transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.inner.inverse_transform_point(p)
    }

    /// Relative transform from `self` to `other`, both expressed in the
    /// same reference frame: if `self` is world->A and `other` is
    /// world->B, the result is A->B. This is exactly the relative pose
    /// `ComputeF12`-style epipolar geometry needs between two keyframes.
    pub fn relative_to(&self, other: &Pose3) -> Pose3 {
        Pose3 {
            inner: self.inner.inverse() * other.inner,
        }
    }

    /// Translation distance between two poses' origins.
    pub fn translation_distance(&self, other: &Pose3) -> f64 {
        (self.translation() - other.translation()).norm()
    }
}

impl Default for Pose3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Pose3 {
    type Output = Pose3;
    fn mul(self, rhs: Pose3) -> Pose3 {
        self.compose(&rhs)
    }
}

impl std::ops::Mul<&Pose3> for &Pose3 {
    type Output = Pose3;
    fn mul(self, rhs: &Pose3) -> Pose3 {
        self.compose(rhs)
    }
}

/// Skew-symmetric cross-product matrix of a 3-vector, `[v]_x`, used to build
/// the essential/fundamental matrix between two keyframes without a
/// stored-per-pair cache.
pub fn skew_symmetric(v: &Vector3<f64>) -> nalgebra::Matrix3<f64> {
    nalgebra::Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}
