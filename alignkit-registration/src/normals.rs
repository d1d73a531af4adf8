//! Normal estimation via covariance plane fitting

use crate::search::KdTree;
use alignkit_core::{Error, NearestNeighborSearch, PointCloud, Point3f, Result, Vector3f};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

/// Configuration for normal estimation
#[derive(Debug, Clone, Copy)]
pub struct NormalEstimationConfig {
    /// Neighborhood search radius
    pub search_radius: f32,
    /// Cap on the number of neighbors used per point
    pub max_neighbors: usize,
    /// Reference point normals are oriented towards
    pub viewpoint: Point3f,
}

impl Default for NormalEstimationConfig {
    fn default() -> Self {
        Self {
            search_radius: 0.1,
            max_neighbors: 30,
            viewpoint: Point3f::origin(),
        }
    }
}

/// Estimate per-point surface normals from local neighborhoods.
///
/// For each point, up to `max_neighbors` neighbors within `search_radius`
/// are gathered and the normal is taken as the eigenvector of the smallest
/// eigenvalue of the neighborhood covariance, the least-variance direction
/// of the local surface patch. Normals are oriented towards the origin
/// viewpoint; use [`estimate_normals_with_config`] to orient towards an
/// arbitrary viewpoint.
///
/// Points with fewer than 3 neighbors get the zero normal marker and are
/// excluded from plane-based residuals downstream; this is not an error.
///
/// Returns a new cloud carrying the normals column; positions and colors are
/// copied from the input.
pub fn estimate_normals(
    cloud: &PointCloud,
    search_radius: f32,
    max_neighbors: usize,
) -> Result<PointCloud> {
    estimate_normals_with_config(
        cloud,
        &NormalEstimationConfig {
            search_radius,
            max_neighbors,
            ..Default::default()
        },
    )
}

/// Estimate normals with full control over the configuration
pub fn estimate_normals_with_config(
    cloud: &PointCloud,
    config: &NormalEstimationConfig,
) -> Result<PointCloud> {
    if !(config.search_radius > 0.0) || !config.search_radius.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "search_radius must be positive, got {}",
            config.search_radius
        )));
    }
    if config.max_neighbors == 0 {
        return Err(Error::InvalidArgument(
            "max_neighbors must be at least 1".to_string(),
        ));
    }

    let tree = KdTree::build(cloud.positions());
    let normals: Vec<Vector3f> = cloud
        .positions()
        .par_iter()
        .map(|p| estimate_one(p, cloud.positions(), &tree, config))
        .collect();

    let mut result = PointCloud::from_points(cloud.positions().to_vec());
    if let Some(colors) = cloud.colors() {
        result = result.with_colors(colors.to_vec())?;
    }
    result.with_normals(normals)
}

/// Flip existing normals so they point towards `viewpoint`.
///
/// Fails with `MissingAttribute` if the cloud carries no normals. Zero
/// normals are left untouched.
pub fn orient_normals_towards_viewpoint(cloud: &mut PointCloud, viewpoint: &Point3f) -> Result<()> {
    let positions = cloud.positions().to_vec();
    let Some(normals) = cloud.normals_mut() else {
        return Err(Error::MissingAttribute(
            "cloud has no normals to orient".to_string(),
        ));
    };
    for (n, p) in normals.iter_mut().zip(positions.iter()) {
        if *n != Vector3f::zeros() {
            *n = oriented(*n, p, viewpoint);
        }
    }
    Ok(())
}

fn estimate_one(
    point: &Point3f,
    positions: &[Point3f],
    tree: &KdTree,
    config: &NormalEstimationConfig,
) -> Vector3f {
    let mut neighbors = tree.find_radius_neighbors(point, config.search_radius);
    if neighbors.len() > config.max_neighbors {
        neighbors.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        neighbors.truncate(config.max_neighbors);
    }
    if neighbors.len() < 3 {
        return Vector3f::zeros();
    }

    let mut centroid = Vector3::<f64>::zeros();
    for &(idx, _) in &neighbors {
        centroid += positions[idx].coords.cast::<f64>();
    }
    centroid /= neighbors.len() as f64;

    let mut covariance = Matrix3::<f64>::zeros();
    for &(idx, _) in &neighbors {
        let d = positions[idx].coords.cast::<f64>() - centroid;
        covariance += d * d.transpose();
    }

    let eigen = covariance.symmetric_eigen();
    let mut smallest = 0;
    for i in 1..3 {
        if eigen.eigenvalues[i] < eigen.eigenvalues[smallest] {
            smallest = i;
        }
    }
    let v = eigen.eigenvectors.column(smallest).into_owned();
    let normal = Vector3f::new(v.x as f32, v.y as f32, v.z as f32);
    let norm = normal.norm();
    if norm < 1e-12 {
        return Vector3f::zeros();
    }

    oriented(normal / norm, point, &config.viewpoint)
}

/// Deterministic sign resolution: towards the viewpoint, and when the
/// viewpoint lies exactly in the tangent plane, the first nonzero component
/// is made positive.
fn oriented(normal: Vector3f, point: &Point3f, viewpoint: &Point3f) -> Vector3f {
    let dot = normal.dot(&(viewpoint - point));
    if dot > 0.0 {
        return normal;
    }
    if dot < 0.0 {
        return -normal;
    }
    for k in 0..3 {
        if normal[k] != 0.0 {
            return if normal[k] > 0.0 { normal } else { -normal };
        }
    }
    normal
}
