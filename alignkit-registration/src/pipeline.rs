//! Coarse-to-fine multi-scale registration

use crate::downsample::voxel_downsample;
use crate::estimate::TransformationEstimator;
use crate::icp::{
    evaluate_registration, ConvergenceCriteria, IcpSolver, RegistrationResult,
};
use crate::normals::estimate_normals;
use alignkit_core::{Error, PointCloud, Result};
use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

/// Neighbor cap for per-level normal estimation
const NORMAL_MAX_NEIGHBORS: usize = 30;

/// One resolution level of the multi-scale schedule.
///
/// Levels run from coarsest (largest voxel) to finest. The normal estimation
/// radius is `radius_multiplier * voxel_size` and the correspondence
/// distance bound equals `voxel_size`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MultiScaleLevel {
    pub voxel_size: f32,
    pub max_iterations: usize,
    pub radius_multiplier: f32,
}

impl MultiScaleLevel {
    /// Level with the conventional normal radius of twice the voxel size
    pub fn new(voxel_size: f32, max_iterations: usize) -> Self {
        Self {
            voxel_size,
            max_iterations,
            radius_multiplier: 2.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.voxel_size > 0.0) || !self.voxel_size.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "voxel_size must be positive, got {}",
                self.voxel_size
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidArgument(
                "level max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.radius_multiplier > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "radius_multiplier must be positive, got {}",
                self.radius_multiplier
            )));
        }
        Ok(())
    }
}

/// Outcome of a multi-scale run
#[derive(Debug, Clone)]
pub struct MultiScaleResult {
    /// Final result, evaluated against the full-resolution clouds
    pub result: RegistrationResult,
    /// Per-level solver results, coarsest first
    pub levels: Vec<RegistrationResult>,
}

/// Register two clouds through a coarse-to-fine schedule of voxel sizes.
///
/// Each level downsamples both clouds, estimates normals when the estimator
/// needs them, and runs a full ICP solve seeded with the transform of the
/// previous level (the initial guess for the first). Coarse levels tolerate
/// a large initial misalignment cheaply; fine levels sharpen the estimate
/// once roughly aligned.
///
/// The returned metrics are re-evaluated against the original
/// full-resolution clouds with the finest level's distance bound, so they
/// describe the alignment the caller actually receives rather than the last
/// downsample of it.
///
/// # Arguments
/// * `source` - Cloud to be aligned
/// * `target` - Cloud to align to
/// * `levels` - Non-empty schedule, coarsest first
/// * `init` - Initial transformation guess
/// * `estimator` - Residual model used at every level
pub fn multi_scale_registration(
    source: &PointCloud,
    target: &PointCloud,
    levels: &[MultiScaleLevel],
    init: Isometry3<f32>,
    estimator: TransformationEstimator,
) -> Result<MultiScaleResult> {
    if levels.is_empty() {
        return Err(Error::InvalidArgument(
            "at least one level is required".to_string(),
        ));
    }
    for level in levels {
        level.validate()?;
    }
    if estimator.requires_colors() && !(source.has_colors() && target.has_colors()) {
        return Err(Error::MissingAttribute(
            "colored ICP requires colors on source and target".to_string(),
        ));
    }

    let mut transform = init;
    let mut level_results = Vec::with_capacity(levels.len());
    let mut total_iterations = 0;

    for (index, level) in levels.iter().enumerate() {
        let mut source_down = voxel_downsample(source, level.voxel_size)?;
        let mut target_down = voxel_downsample(target, level.voxel_size)?;

        if estimator.requires_normals() {
            let radius = level.radius_multiplier * level.voxel_size;
            source_down = estimate_normals(&source_down, radius, NORMAL_MAX_NEIGHBORS)?;
            target_down = estimate_normals(&target_down, radius, NORMAL_MAX_NEIGHBORS)?;
        }

        let criteria = ConvergenceCriteria {
            max_iterations: level.max_iterations,
            ..Default::default()
        };
        let result = IcpSolver::new(
            &source_down,
            &target_down,
            level.voxel_size,
            transform,
            estimator,
            criteria,
        )?
        .run()?;

        log::debug!(
            "multi-scale level {} (voxel {}): {} points, {} iterations, fitness {:.4}, rmse {:.6}",
            index,
            level.voxel_size,
            source_down.len(),
            result.iterations,
            result.fitness,
            result.inlier_rmse
        );

        transform = result.transformation;
        total_iterations += result.iterations;
        level_results.push(result);
    }

    let finest = levels[levels.len() - 1];
    let mut result = evaluate_registration(source, target, finest.voxel_size, transform)?;
    result.iterations = total_iterations;

    Ok(MultiScaleResult {
        result,
        levels: level_results,
    })
}
