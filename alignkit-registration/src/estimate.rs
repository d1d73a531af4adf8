//! Incremental rigid transformation estimators
//!
//! Three residual models behind one interface: point-to-point (closed-form
//! SVD), point-to-plane (linearized 6x6 normal equations), and colored ICP
//! (point-to-plane plus a photometric term, after Park, Zhou and Koltun,
//! "Colored Point Cloud Registration Revisited", ICCV 2017).

use crate::correspondence::Correspondence;
use crate::search::KdTree;
use alignkit_core::{Error, NearestNeighborSearch, PointCloud, Result, Vector3f};
use nalgebra::{Isometry3, Matrix3, Matrix6, Translation3, UnitQuaternion, Vector3, Vector6};
use rayon::prelude::*;

/// Geometric weight of the colored-ICP joint residual; the photometric term
/// gets `1 - lambda`. Tuned value from the cited publication.
pub const DEFAULT_LAMBDA_GEOMETRIC: f32 = 0.968;

/// Result of one incremental estimation step
#[derive(Debug, Clone, Copy)]
pub struct IncrementEstimate {
    /// Incremental rigid transform to compose onto the cumulative one
    pub transform: Isometry3<f32>,
    /// Fraction of source points with an accepted correspondence
    pub fitness: f32,
    /// Root-mean-square of this estimator's residual over the accepted pairs
    pub rmse: f32,
}

/// Strategy selection for the incremental transform solve.
///
/// Each variant holds only its own configuration and
/// [`estimate_increment`](TransformationEstimator::estimate_increment) is a
/// pure function of its inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformationEstimator {
    /// Minimize squared Euclidean distances between corresponded points
    PointToPoint,
    /// Minimize squared distances to the tangent plane at each target point
    PointToPlane,
    /// Jointly minimize point-to-plane and photometric residuals
    ColoredIcp { lambda_geometric: f32 },
}

impl TransformationEstimator {
    /// Colored ICP with the publication's tuned geometric weight
    pub fn colored() -> Self {
        Self::ColoredIcp {
            lambda_geometric: DEFAULT_LAMBDA_GEOMETRIC,
        }
    }

    /// Whether this variant needs normals on the clouds
    pub fn requires_normals(&self) -> bool {
        !matches!(self, Self::PointToPoint)
    }

    /// Whether this variant needs colors on the clouds
    pub fn requires_colors(&self) -> bool {
        matches!(self, Self::ColoredIcp { .. })
    }

    /// Fail fast when the clouds lack attributes this variant consumes.
    pub fn validate(&self, source: &PointCloud, target: &PointCloud) -> Result<()> {
        match self {
            Self::PointToPoint => Ok(()),
            Self::PointToPlane => {
                if !target.has_normals() {
                    return Err(Error::MissingAttribute(
                        "point-to-plane estimation requires target normals".to_string(),
                    ));
                }
                Ok(())
            }
            Self::ColoredIcp { lambda_geometric } => {
                if !(0.0..=1.0).contains(lambda_geometric) {
                    return Err(Error::InvalidArgument(format!(
                        "lambda_geometric must be in [0, 1], got {lambda_geometric}"
                    )));
                }
                if !source.has_normals() || !target.has_normals() {
                    return Err(Error::MissingAttribute(
                        "colored ICP requires normals on source and target".to_string(),
                    ));
                }
                if !source.has_colors() || !target.has_colors() {
                    return Err(Error::MissingAttribute(
                        "colored ICP requires colors on source and target".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Estimate the incremental transform for one ICP iteration.
    ///
    /// `source` is the source cloud under the current cumulative transform;
    /// `color_gradients` is the precomputed per-target-point gradient field
    /// (colored variant only, see [`compute_color_gradients`]).
    pub fn estimate_increment(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        correspondences: &[Correspondence],
        color_gradients: Option<&[Vector3f]>,
    ) -> Result<IncrementEstimate> {
        if correspondences.len() < 3 {
            return Err(Error::Algorithm(format!(
                "at least 3 correspondences required, got {}",
                correspondences.len()
            )));
        }

        match self {
            Self::PointToPoint => estimate_point_to_point(source, target, correspondences),
            Self::PointToPlane => {
                estimate_linearized(source, target, correspondences, 1.0, None)
            }
            Self::ColoredIcp { lambda_geometric } => {
                let gradients = color_gradients.ok_or_else(|| {
                    Error::Algorithm("color gradients were not prepared for this target".to_string())
                })?;
                estimate_linearized(
                    source,
                    target,
                    correspondences,
                    *lambda_geometric,
                    Some(gradients),
                )
            }
        }
    }
}

/// Closed-form point-to-point solve via SVD of the cross-covariance of the
/// centered corresponded sets, with reflection correction.
fn estimate_point_to_point(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
) -> Result<IncrementEstimate> {
    let n = correspondences.len() as f64;

    let mut source_centroid = Vector3::<f64>::zeros();
    let mut target_centroid = Vector3::<f64>::zeros();
    for c in correspondences {
        source_centroid += source.positions()[c.source_index].coords.cast::<f64>();
        target_centroid += target.positions()[c.target_index].coords.cast::<f64>();
    }
    source_centroid /= n;
    target_centroid /= n;

    let mut h = Matrix3::<f64>::zeros();
    for c in correspondences {
        let p = source.positions()[c.source_index].coords.cast::<f64>() - source_centroid;
        let q = target.positions()[c.target_index].coords.cast::<f64>() - target_centroid;
        h += p * q.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| Error::Algorithm("SVD U matrix not available".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::Algorithm("SVD V^T matrix not available".to_string()))?;

    let mut r = v_t.transpose() * u.transpose();
    if r.determinant() < 0.0 {
        let mut v_t_corrected = v_t;
        v_t_corrected.set_row(2, &(-v_t.row(2)));
        r = v_t_corrected.transpose() * u.transpose();
    }

    let rotation = UnitQuaternion::from_matrix(&r);
    let translation = target_centroid - r * source_centroid;
    let transform = Isometry3::from_parts(Translation3::from(translation), rotation).cast::<f32>();

    let residual_sq: f64 = correspondences
        .iter()
        .map(|c| c.distance_sq as f64)
        .sum();

    Ok(IncrementEstimate {
        transform,
        fitness: correspondences.len() as f32 / source.len() as f32,
        rmse: (residual_sq / n).sqrt() as f32,
    })
}

struct NormalEquations {
    ata: Matrix6<f64>,
    atb: Vector6<f64>,
    residual_sq: f64,
    count: usize,
}

impl NormalEquations {
    fn zero() -> Self {
        Self {
            ata: Matrix6::zeros(),
            atb: Vector6::zeros(),
            residual_sq: 0.0,
            count: 0,
        }
    }

    fn add_row(&mut self, a: Vector6<f64>, b: f64) {
        self.ata += a * a.transpose();
        self.atb += a * b;
    }

    fn merge(mut self, other: Self) -> Self {
        self.ata += other.ata;
        self.atb += other.atb;
        self.residual_sq += other.residual_sq;
        self.count += other.count;
        self
    }
}

/// Linearized solve shared by point-to-plane and colored ICP.
///
/// Small-angle approximation of the rotation gives, per correspondence, the
/// geometric row `a = [s x n, n]` with rhs `b = (t - s) . n`, and for the
/// colored variant an additional photometric row for the tangent-plane
/// intensity mismatch. Rows are weighted sqrt(lambda) and sqrt(1 - lambda)
/// and accumulated into a 6x6 system solved by Cholesky with LU fallback.
/// Correspondences whose target normal is the zero marker are excluded.
fn estimate_linearized(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
    lambda_geometric: f32,
    color_gradients: Option<&[Vector3f]>,
) -> Result<IncrementEstimate> {
    let target_normals = target
        .normals()
        .ok_or_else(|| Error::MissingAttribute("target normals required".to_string()))?;
    let photometric = match color_gradients {
        Some(gradients) => {
            let source_colors = source.colors().ok_or_else(|| {
                Error::MissingAttribute("colored ICP requires source colors".to_string())
            })?;
            let target_colors = target.colors().ok_or_else(|| {
                Error::MissingAttribute("colored ICP requires target colors".to_string())
            })?;
            Some((gradients, source_colors, target_colors))
        }
        None => None,
    };

    let sqrt_lambda = (lambda_geometric as f64).sqrt();
    let sqrt_mu = (1.0 - lambda_geometric as f64).max(0.0).sqrt();

    let system = correspondences
        .par_iter()
        .fold(NormalEquations::zero, |mut acc, c| {
            let normal = target_normals[c.target_index];
            if normal == Vector3f::zeros() {
                return acc;
            }

            let s = source.positions()[c.source_index].coords.cast::<f64>();
            let t = target.positions()[c.target_index].coords.cast::<f64>();
            let n = normal.cast::<f64>();

            let b_geo = (t - s).dot(&n);
            let a_geo = s.cross(&n);
            acc.add_row(
                sqrt_lambda * Vector6::new(a_geo.x, a_geo.y, a_geo.z, n.x, n.y, n.z),
                sqrt_lambda * b_geo,
            );
            acc.residual_sq += lambda_geometric as f64 * b_geo * b_geo;

            if let Some((gradients, source_colors, target_colors)) = photometric {
                let gradient = gradients[c.target_index].cast::<f64>();
                // keep the gradient strictly tangent to the local plane
                let g = gradient - n * n.dot(&gradient);

                let s_proj = s - (s - t).dot(&n) * n;
                let intensity_source = intensity(&source_colors[c.source_index]) as f64;
                let intensity_target = intensity(&target_colors[c.target_index]) as f64;
                let intensity_proj = intensity_target + g.dot(&(s_proj - t));

                let b_photo = intensity_proj - intensity_source;
                let a_photo = s.cross(&g);
                acc.add_row(
                    sqrt_mu * Vector6::new(a_photo.x, a_photo.y, a_photo.z, -g.x, -g.y, -g.z),
                    sqrt_mu * b_photo,
                );
                acc.residual_sq += (1.0 - lambda_geometric as f64) * b_photo * b_photo;
            }

            acc.count += 1;
            acc
        })
        .reduce(NormalEquations::zero, NormalEquations::merge);

    if system.count < 3 {
        return Err(Error::Algorithm(
            "too few correspondences with valid target normals".to_string(),
        ));
    }

    let transform = solve_normal_equations(system.ata, system.atb)?;

    Ok(IncrementEstimate {
        transform,
        fitness: correspondences.len() as f32 / source.len() as f32,
        rmse: (system.residual_sq / system.count as f64).sqrt() as f32,
    })
}

fn solve_normal_equations(mut ata: Matrix6<f64>, atb: Vector6<f64>) -> Result<Isometry3<f32>> {
    // Tikhonov damping scaled to the matrix keeps rank-deficient systems
    // (flat geometry with unconstrained tangent motion) solvable.
    let diag_max = (0..6).map(|i| ata[(i, i)].abs()).fold(0.0_f64, f64::max);
    let damping = 1e-6 * diag_max.max(1e-12);
    for i in 0..6 {
        ata[(i, i)] += damping;
    }

    let x = match ata.cholesky() {
        Some(cholesky) => cholesky.solve(&atb),
        None => ata
            .lu()
            .solve(&atb)
            .ok_or_else(|| Error::Algorithm("6x6 normal equations are singular".to_string()))?,
    };

    let omega = Vector3::new(x[0], x[1], x[2]);
    let translation = Vector3::new(x[3], x[4], x[5]);
    let transform = Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_scaled_axis(omega),
    );
    Ok(transform.cast::<f32>())
}

/// Scalar intensity of an RGB color
fn intensity(color: &Vector3f) -> f32 {
    (color.x + color.y + color.z) / 3.0
}

/// Precompute the per-point intensity gradient field of a colored cloud.
///
/// For each point the gradient of the intensity function is fitted by least
/// squares over the radius neighborhood, with each neighbor projected onto
/// the point's tangent plane, and constrained to stay tangent to the local
/// surface. Points with a zero normal or fewer than 4 neighbors get a zero
/// gradient. Requires normals and colors; fails with `MissingAttribute`
/// otherwise.
pub fn compute_color_gradients(
    cloud: &PointCloud,
    tree: &KdTree,
    radius: f32,
    max_neighbors: usize,
) -> Result<Vec<Vector3f>> {
    let normals = cloud
        .normals()
        .ok_or_else(|| Error::MissingAttribute("color gradients require normals".to_string()))?;
    let colors = cloud
        .colors()
        .ok_or_else(|| Error::MissingAttribute("color gradients require colors".to_string()))?;

    if !(radius > 0.0) || !radius.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "gradient search radius must be positive, got {radius}"
        )));
    }

    let positions = cloud.positions();
    let gradients = positions
        .par_iter()
        .enumerate()
        .map(|(i, point)| {
            let normal = normals[i];
            if normal == Vector3f::zeros() {
                return Vector3f::zeros();
            }

            let mut neighbors = tree.find_radius_neighbors(point, radius);
            if neighbors.len() > max_neighbors {
                neighbors.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                neighbors.truncate(max_neighbors);
            }
            let others = neighbors.iter().filter(|&&(j, _)| j != i).count();
            if others < 4 {
                return Vector3f::zeros();
            }

            let p = point.coords.cast::<f64>();
            let n = normal.cast::<f64>();
            let intensity_p = intensity(&colors[i]) as f64;

            let mut ata = Matrix3::<f64>::zeros();
            let mut atb = Vector3::<f64>::zeros();
            for &(j, _) in &neighbors {
                if j == i {
                    continue;
                }
                let pj = positions[j].coords.cast::<f64>();
                let projected = pj - (pj - p).dot(&n) * n;
                let a = projected - p;
                let b = intensity(&colors[j]) as f64 - intensity_p;
                ata += a * a.transpose();
                atb += a * b;
            }
            // tangency constraint: gradient . n = 0, weighted by neighbor count
            ata += (others as f64) * n * n.transpose();

            let diag_max = (0..3).map(|k| ata[(k, k)].abs()).fold(0.0_f64, f64::max);
            let damping = 1e-6 * diag_max.max(1e-12);
            for k in 0..3 {
                ata[(k, k)] += damping;
            }

            let g = match ata.cholesky() {
                Some(cholesky) => cholesky.solve(&atb),
                None => match ata.lu().solve(&atb) {
                    Some(solution) => solution,
                    None => return Vector3f::zeros(),
                },
            };
            let g = g - n * n.dot(&g);
            Vector3f::new(g.x as f32, g.y as f32, g.z as f32)
        })
        .collect();

    Ok(gradients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alignkit_core::Point3f;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn grid_cloud(n: usize, spacing: f32) -> PointCloud {
        let mut positions = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    positions.push(Point3f::new(
                        x as f32 * spacing,
                        y as f32 * spacing,
                        z as f32 * spacing,
                    ));
                }
            }
        }
        PointCloud::from_points(positions)
    }

    fn identity_correspondences(source: &PointCloud, target: &PointCloud) -> Vec<Correspondence> {
        source
            .positions()
            .iter()
            .zip(target.positions().iter())
            .enumerate()
            .map(|(i, (s, t))| Correspondence {
                source_index: i,
                target_index: i,
                distance_sq: (s - t).norm_squared(),
            })
            .collect()
    }

    #[test]
    fn test_point_to_point_recovers_translation() {
        let source = grid_cloud(4, 0.25);
        let translation = Vector3f::new(0.1, -0.05, 0.2);
        let target = PointCloud::from_points(
            source.positions().iter().map(|p| p + translation).collect(),
        );

        let correspondences = identity_correspondences(&source, &target);
        let estimate = TransformationEstimator::PointToPoint
            .estimate_increment(&source, &target, &correspondences, None)
            .unwrap();

        let t = estimate.transform.translation.vector;
        assert_relative_eq!(t.x, translation.x, epsilon = 1e-5);
        assert_relative_eq!(t.y, translation.y, epsilon = 1e-5);
        assert_relative_eq!(t.z, translation.z, epsilon = 1e-5);
        assert_relative_eq!(estimate.fitness, 1.0);
        assert_relative_eq!(estimate.rmse, translation.norm(), epsilon = 1e-5);
    }

    #[test]
    fn test_point_to_point_recovers_rotation() {
        let source = grid_cloud(4, 0.25);
        let rotation = UnitQuaternion::from_axis_angle(&Vector3f::z_axis(), 0.3);
        let target = PointCloud::from_points(
            source.positions().iter().map(|p| rotation * p).collect(),
        );

        let correspondences = identity_correspondences(&source, &target);
        let estimate = TransformationEstimator::PointToPoint
            .estimate_increment(&source, &target, &correspondences, None)
            .unwrap();

        assert!(estimate.transform.rotation.angle_to(&rotation) < 1e-5);
        assert!(estimate.transform.translation.vector.norm() < 1e-5);
    }

    #[test]
    fn test_too_few_correspondences() {
        let source = grid_cloud(2, 0.5);
        let target = grid_cloud(2, 0.5);
        let correspondences = vec![Correspondence {
            source_index: 0,
            target_index: 0,
            distance_sq: 0.0,
        }];
        assert!(TransformationEstimator::PointToPoint
            .estimate_increment(&source, &target, &correspondences, None)
            .is_err());
    }

    #[test]
    fn test_point_to_plane_requires_target_normals() {
        let cloud = grid_cloud(2, 0.5);
        let err = TransformationEstimator::PointToPlane
            .validate(&cloud, &cloud)
            .unwrap_err();
        assert!(matches!(err, Error::MissingAttribute(_)));
    }

    #[test]
    fn test_colored_requires_normals_and_colors() {
        let plain = grid_cloud(2, 0.5);
        let estimator = TransformationEstimator::colored();
        assert!(matches!(
            estimator.validate(&plain, &plain).unwrap_err(),
            Error::MissingAttribute(_)
        ));

        let with_normals = grid_cloud(2, 0.5)
            .with_normals(vec![Vector3f::z(); 8])
            .unwrap();
        assert!(matches!(
            estimator.validate(&with_normals, &with_normals).unwrap_err(),
            Error::MissingAttribute(_)
        ));

        let full = with_normals
            .with_colors(vec![Vector3f::new(0.5, 0.5, 0.5); 8])
            .unwrap();
        assert!(estimator.validate(&full, &full).is_ok());

        let bad_lambda = TransformationEstimator::ColoredIcp {
            lambda_geometric: 1.5,
        };
        assert!(matches!(
            bad_lambda.validate(&full, &full).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    fn plane_with_intensity(n: usize, spacing: f32, z: f32) -> PointCloud {
        let mut positions = Vec::new();
        let mut colors = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let x = i as f32 * spacing;
                let y = j as f32 * spacing;
                positions.push(Point3f::new(x, y, z));
                let value = 0.5 + 0.3 * x;
                colors.push(Vector3f::new(value, value, value));
            }
        }
        let count = positions.len();
        PointCloud::from_points(positions)
            .with_colors(colors)
            .unwrap()
            .with_normals(vec![Vector3f::z(); count])
            .unwrap()
    }

    #[test]
    fn test_point_to_plane_recovers_offset_along_normal() {
        let target = plane_with_intensity(10, 0.1, 0.0);
        let source = plane_with_intensity(10, 0.1, 0.1);

        let correspondences = identity_correspondences(&source, &target);
        let estimate = TransformationEstimator::PointToPlane
            .estimate_increment(&source, &target, &correspondences, None)
            .unwrap();

        let t = estimate.transform.translation.vector;
        assert_relative_eq!(t.z, -0.1, epsilon = 1e-4);
        assert_relative_eq!(estimate.rmse, 0.1, epsilon = 1e-4);
    }

    #[test]
    fn test_zero_normals_are_excluded() {
        let target_positions: Vec<Point3f> =
            (0..10).map(|i| Point3f::new(i as f32 * 0.1, 0.0, 0.0)).collect();
        let mut normals = vec![Vector3f::z(); 10];
        normals[0] = Vector3f::zeros();
        let target = PointCloud::from_points(target_positions.clone())
            .with_normals(normals)
            .unwrap();
        let source = PointCloud::from_points(target_positions);

        let correspondences = identity_correspondences(&source, &target);
        let estimate = TransformationEstimator::PointToPlane
            .estimate_increment(&source, &target, &correspondences, None)
            .unwrap();

        // all residuals are zero regardless, but the solve must not blow up
        assert!(estimate.transform.translation.vector.norm() < 1e-6);
    }

    #[test]
    fn test_color_gradient_of_linear_ramp() {
        let cloud = plane_with_intensity(12, 0.1, 0.0);
        let tree = KdTree::build(cloud.positions());
        let gradients = compute_color_gradients(&cloud, &tree, 0.35, 30).unwrap();

        // interior points see a symmetric neighborhood; check one
        let center = cloud
            .positions()
            .iter()
            .position(|p| (p - Point3::new(0.5, 0.5, 0.0)).norm() < 1e-6)
            .unwrap();
        let g = gradients[center];
        assert_relative_eq!(g.x, 0.3, epsilon = 0.02);
        assert_relative_eq!(g.y, 0.0, epsilon = 0.02);
        assert_relative_eq!(g.z, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_colored_with_full_geometric_weight_matches_point_to_plane() {
        let target = plane_with_intensity(10, 0.1, 0.0);
        let source = plane_with_intensity(10, 0.1, 0.07);

        let tree = KdTree::build(target.positions());
        let gradients = compute_color_gradients(&target, &tree, 0.35, 30).unwrap();
        let correspondences = identity_correspondences(&source, &target);

        let plane = TransformationEstimator::PointToPlane
            .estimate_increment(&source, &target, &correspondences, None)
            .unwrap();
        let colored = TransformationEstimator::ColoredIcp {
            lambda_geometric: 1.0,
        }
        .estimate_increment(&source, &target, &correspondences, Some(&gradients))
        .unwrap();

        let dt = plane.transform.translation.vector - colored.transform.translation.vector;
        assert!(dt.norm() < 1e-6);
        assert!(plane.transform.rotation.angle_to(&colored.transform.rotation) < 1e-6);
        assert_relative_eq!(plane.rmse, colored.rmse, epsilon = 1e-6);
    }
}
