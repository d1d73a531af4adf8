//! Point cloud data structures and functionality

use crate::error::{Error, Result};
use crate::point::{Point3f, Vector3f};
use crate::transform::Transform3D;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// A point cloud with optional per-point normals and colors.
///
/// Positions are required; normals and colors are optional columns whose
/// length always matches the number of points. Colors are RGB in `[0, 1]`.
/// A zero normal marks a point whose local surface could not be estimated;
/// such points are skipped by plane-based residuals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointCloud {
    positions: Vec<Point3f>,
    normals: Option<Vec<Vector3f>>,
    colors: Option<Vec<Vector3f>>,
}

impl PointCloud {
    /// Create a new empty point cloud
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new point cloud with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            normals: None,
            colors: None,
        }
    }

    /// Create a point cloud from a vector of positions
    pub fn from_points(positions: Vec<Point3f>) -> Self {
        Self {
            positions,
            normals: None,
            colors: None,
        }
    }

    /// Attach a normals column.
    ///
    /// Fails with `InvalidArgument` if the column length does not match the
    /// number of points.
    pub fn with_normals(mut self, normals: Vec<Vector3f>) -> Result<Self> {
        if normals.len() != self.positions.len() {
            return Err(Error::InvalidArgument(format!(
                "normals length {} does not match point count {}",
                normals.len(),
                self.positions.len()
            )));
        }
        self.normals = Some(normals);
        Ok(self)
    }

    /// Attach a colors column (RGB in `[0, 1]`).
    ///
    /// Fails with `InvalidArgument` if the column length does not match the
    /// number of points.
    pub fn with_colors(mut self, colors: Vec<Vector3f>) -> Result<Self> {
        if colors.len() != self.positions.len() {
            return Err(Error::InvalidArgument(format!(
                "colors length {} does not match point count {}",
                colors.len(),
                self.positions.len()
            )));
        }
        self.colors = Some(colors);
        Ok(self)
    }

    /// Get the number of points in the cloud
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Check if the point cloud is empty
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Whether the cloud carries a normals column
    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Whether the cloud carries a colors column
    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    /// Point positions
    pub fn positions(&self) -> &[Point3f] {
        &self.positions
    }

    /// Per-point normals, if present
    pub fn normals(&self) -> Option<&[Vector3f]> {
        self.normals.as_deref()
    }

    /// Mutable access to the normals column, if present
    pub fn normals_mut(&mut self) -> Option<&mut [Vector3f]> {
        self.normals.as_deref_mut()
    }

    /// Per-point colors, if present
    pub fn colors(&self) -> Option<&[Vector3f]> {
        self.colors.as_deref()
    }

    /// Get an iterator over the point positions
    pub fn iter(&self) -> std::slice::Iter<'_, Point3f> {
        self.positions.iter()
    }

    /// Axis-aligned bounding box of the cloud.
    ///
    /// Returns `(origin, origin)` for an empty cloud.
    pub fn bounding_box(&self) -> (Point3f, Point3f) {
        if self.is_empty() {
            return (Point3f::origin(), Point3f::origin());
        }

        let mut min = self.positions[0];
        let mut max = self.positions[0];

        for p in &self.positions {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);

            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        (min, max)
    }

    /// Center of the bounding box
    pub fn center(&self) -> Point3f {
        let (min, max) = self.bounding_box();
        Point3f::new(
            (min.x + max.x) / 2.0,
            (min.y + max.y) / 2.0,
            (min.z + max.z) / 2.0,
        )
    }

    /// Apply a transformation in place.
    ///
    /// Positions move under the full rigid motion; normals rotate with the
    /// rotation block only. Zero (degenerate) normals stay zero.
    pub fn transform(&mut self, transform: &Transform3D) {
        for p in &mut self.positions {
            *p = transform.transform_point(p);
        }
        if let Some(normals) = &mut self.normals {
            for n in normals.iter_mut() {
                *n = transform.transform_vector(n);
            }
        }
    }

    /// Return a transformed copy, leaving this cloud unmodified
    pub fn transformed(&self, transform: &Transform3D) -> Self {
        let mut cloud = self.clone();
        cloud.transform(transform);
        cloud
    }
}

impl Index<usize> for PointCloud {
    type Output = Point3f;

    fn index(&self, index: usize) -> &Self::Output {
        &self.positions[index]
    }
}

impl FromIterator<Point3f> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point3f>>(iter: I) -> Self {
        Self::from_points(Vec::from_iter(iter))
    }
}

impl<'a> IntoIterator for &'a PointCloud {
    type Item = &'a Point3f;
    type IntoIter = std::slice::Iter<'a, Point3f>;

    fn into_iter(self) -> Self::IntoIter {
        self.positions.iter()
    }
}
