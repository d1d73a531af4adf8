//! Voxel grid downsampling

use alignkit_core::{Error, PointCloud, Point3f, Result, Vector3f};
use nalgebra::Vector3;
use std::collections::HashMap;

struct VoxelAccumulator {
    position_sum: Vector3<f64>,
    normal_sum: Vector3<f64>,
    color_sum: Vector3<f64>,
    count: usize,
    first_index: usize,
}

impl VoxelAccumulator {
    fn new(first_index: usize) -> Self {
        Self {
            position_sum: Vector3::zeros(),
            normal_sum: Vector3::zeros(),
            color_sum: Vector3::zeros(),
            count: 0,
            first_index,
        }
    }
}

/// Voxel grid downsampling.
///
/// Partitions space into axis-aligned cubes of edge `voxel_size` anchored at
/// the cloud's minimum bound; each non-empty cube contributes one output
/// point at the arithmetic mean of its members. Normals are averaged and
/// re-normalized (a zero-length average degrades to the zero marker), colors
/// are averaged componentwise. The input cloud is left unmodified and output
/// ordering follows the first appearance of each voxel in the input.
///
/// # Arguments
/// * `cloud` - Input point cloud
/// * `voxel_size` - Edge length of each voxel cube
///
/// # Example
/// ```rust
/// use alignkit_core::{PointCloud, Point3f};
/// use alignkit_registration::voxel_downsample;
///
/// fn main() -> alignkit_core::Result<()> {
///     let cloud = PointCloud::from_points(vec![
///         Point3f::new(0.0, 0.0, 0.0),
///         Point3f::new(0.05, 0.0, 0.0),
///         Point3f::new(1.0, 0.0, 0.0),
///     ]);
///
///     let down = voxel_downsample(&cloud, 0.2)?;
///     assert_eq!(down.len(), 2);
///     Ok(())
/// }
/// ```
pub fn voxel_downsample(cloud: &PointCloud, voxel_size: f32) -> Result<PointCloud> {
    if !(voxel_size > 0.0) || !voxel_size.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "voxel_size must be positive, got {voxel_size}"
        )));
    }
    if cloud.is_empty() {
        return Ok(PointCloud::new());
    }

    let (min_bound, _) = cloud.bounding_box();
    let voxel_coords = |p: &Point3f| -> (i32, i32, i32) {
        (
            ((p.x - min_bound.x) / voxel_size).floor() as i32,
            ((p.y - min_bound.y) / voxel_size).floor() as i32,
            ((p.z - min_bound.z) / voxel_size).floor() as i32,
        )
    };

    let normals = cloud.normals();
    let colors = cloud.colors();

    let mut voxels: HashMap<(i32, i32, i32), VoxelAccumulator> = HashMap::new();
    for (idx, p) in cloud.iter().enumerate() {
        let accum = voxels
            .entry(voxel_coords(p))
            .or_insert_with(|| VoxelAccumulator::new(idx));
        accum.position_sum += p.coords.cast::<f64>();
        if let Some(normals) = normals {
            accum.normal_sum += normals[idx].cast::<f64>();
        }
        if let Some(colors) = colors {
            accum.color_sum += colors[idx].cast::<f64>();
        }
        accum.count += 1;
    }

    // HashMap iteration order is unstable; sort by first appearance so the
    // output is deterministic for identical input orderings.
    let mut bins: Vec<VoxelAccumulator> = voxels.into_values().collect();
    bins.sort_unstable_by_key(|accum| accum.first_index);

    let mut positions = Vec::with_capacity(bins.len());
    let mut out_normals = normals.map(|_| Vec::with_capacity(bins.len()));
    let mut out_colors = colors.map(|_| Vec::with_capacity(bins.len()));

    for accum in &bins {
        let inv = 1.0 / accum.count as f64;
        let mean = accum.position_sum * inv;
        positions.push(Point3f::new(mean.x as f32, mean.y as f32, mean.z as f32));

        if let Some(out) = &mut out_normals {
            let mean = accum.normal_sum * inv;
            let norm = mean.norm();
            let normal = if norm > 1e-12 { mean / norm } else { Vector3::zeros() };
            out.push(Vector3f::new(normal.x as f32, normal.y as f32, normal.z as f32));
        }
        if let Some(out) = &mut out_colors {
            let mean = accum.color_sum * inv;
            out.push(Vector3f::new(mean.x as f32, mean.y as f32, mean.z as f32));
        }
    }

    let mut result = PointCloud::from_points(positions);
    if let Some(out) = out_normals {
        result = result.with_normals(out)?;
    }
    if let Some(out) = out_colors {
        result = result.with_colors(out)?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rejects_non_positive_voxel_size() {
        let cloud = PointCloud::from_points(vec![Point3f::origin()]);
        assert!(voxel_downsample(&cloud, 0.0).is_err());
        assert!(voxel_downsample(&cloud, -1.0).is_err());
        assert!(voxel_downsample(&cloud, f32::NAN).is_err());
    }

    #[test]
    fn test_empty_cloud() {
        let down = voxel_downsample(&PointCloud::new(), 0.5).unwrap();
        assert!(down.is_empty());
    }

    #[test]
    fn test_never_grows_and_stays_in_bounds() {
        let positions: Vec<Point3f> = (0..100)
            .map(|i| {
                let t = i as f32 * 0.013;
                Point3f::new(t.sin(), t.cos(), t * 0.1)
            })
            .collect();
        let cloud = PointCloud::from_points(positions);
        let (min, max) = cloud.bounding_box();

        let down = voxel_downsample(&cloud, 0.25).unwrap();
        assert!(down.len() <= cloud.len());
        assert!(!down.is_empty());

        for p in &down {
            assert!(p.x >= min.x - 1e-6 && p.x <= max.x + 1e-6);
            assert!(p.y >= min.y - 1e-6 && p.y <= max.y + 1e-6);
            assert!(p.z >= min.z - 1e-6 && p.z <= max.z + 1e-6);
        }
    }

    #[test]
    fn test_averages_positions_within_bin() {
        let cloud = PointCloud::from_points(vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(0.1, 0.0, 0.0),
            Point3f::new(0.0, 0.1, 0.0),
            Point3f::new(0.1, 0.1, 0.0),
        ]);

        let down = voxel_downsample(&cloud, 1.0).unwrap();
        assert_eq!(down.len(), 1);
        assert_relative_eq!(down[0].x, 0.05, epsilon = 1e-6);
        assert_relative_eq!(down[0].y, 0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_averages_attributes() {
        let cloud = PointCloud::from_points(vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(0.01, 0.0, 0.0),
        ])
        .with_normals(vec![Vector3f::z(), Vector3f::z()])
        .unwrap()
        .with_colors(vec![
            Vector3f::new(1.0, 0.0, 0.0),
            Vector3f::new(0.0, 1.0, 0.0),
        ])
        .unwrap();

        let down = voxel_downsample(&cloud, 0.5).unwrap();
        assert_eq!(down.len(), 1);

        let n = down.normals().unwrap()[0];
        assert_relative_eq!(n.z, 1.0, epsilon = 1e-6);

        let c = down.colors().unwrap()[0];
        assert_relative_eq!(c.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(c.y, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_opposed_normals_average_to_zero_marker() {
        let cloud = PointCloud::from_points(vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(0.01, 0.0, 0.0),
        ])
        .with_normals(vec![Vector3f::z(), -Vector3f::z()])
        .unwrap();

        let down = voxel_downsample(&cloud, 0.5).unwrap();
        assert_eq!(down.normals().unwrap()[0], Vector3f::zeros());
    }
}
