//! 3D rigid transformation utilities

use nalgebra::{Isometry3, Matrix3, Matrix4, Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid 3D transformation stored as a 4x4 homogeneous matrix.
///
/// The upper-left 3x3 block is the rotation, the last column the translation.
/// `to_isometry` re-orthonormalizes the rotation block, which is the entry
/// point for matrices coming from external callers or accumulated updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform3D {
    pub matrix: Matrix4<f32>,
}

impl Transform3D {
    /// Create an identity transformation
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// Create a translation transformation
    pub fn translation(translation: Vector3<f32>) -> Self {
        Self {
            matrix: Matrix4::new_translation(&translation),
        }
    }

    /// Create a rotation transformation from a quaternion
    pub fn rotation(rotation: UnitQuaternion<f32>) -> Self {
        Self {
            matrix: rotation.to_homogeneous(),
        }
    }

    /// Create a transformation from translation and rotation
    pub fn from_translation_rotation(
        translation: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
    ) -> Self {
        let isometry = Isometry3::from_parts(translation.into(), rotation);
        Self {
            matrix: isometry.to_homogeneous(),
        }
    }

    /// The 3x3 rotation block
    pub fn rotation_matrix(&self) -> Matrix3<f32> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// The translation column
    pub fn translation_vector(&self) -> Vector3<f32> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Convert to an isometry, re-orthonormalizing the rotation block.
    pub fn to_isometry(&self) -> Isometry3<f32> {
        let rotation = UnitQuaternion::from_matrix(&self.rotation_matrix());
        Isometry3::from_parts(self.translation_vector().into(), rotation)
    }

    /// Apply the transformation to a point
    pub fn transform_point(&self, point: &Point3<f32>) -> Point3<f32> {
        let homogeneous = self.matrix * point.to_homogeneous();
        Point3::from_homogeneous(homogeneous).unwrap_or(*point)
    }

    /// Apply the rotation block to a vector
    pub fn transform_vector(&self, vector: &Vector3<f32>) -> Vector3<f32> {
        self.matrix.fixed_view::<3, 3>(0, 0) * vector
    }

    /// Compose this transformation with another (`self` applied after `other`)
    pub fn compose(self, other: Self) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    /// Get the inverse transformation
    pub fn inverse(self) -> Option<Self> {
        self.matrix.try_inverse().map(|inv_matrix| Self {
            matrix: inv_matrix,
        })
    }

    /// Check if this is approximately the identity transformation
    pub fn is_identity(&self, epsilon: f32) -> bool {
        let identity = Matrix4::identity();
        (self.matrix - identity).norm() < epsilon
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Transform3D {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        self.compose(rhs)
    }
}

impl From<Matrix4<f32>> for Transform3D {
    fn from(matrix: Matrix4<f32>) -> Self {
        Self { matrix }
    }
}

impl From<Isometry3<f32>> for Transform3D {
    fn from(isometry: Isometry3<f32>) -> Self {
        Self {
            matrix: isometry.to_homogeneous(),
        }
    }
}
