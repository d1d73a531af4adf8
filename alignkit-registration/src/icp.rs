//! ICP solver: the fixed-point iteration for one resolution level

use crate::correspondence::find_correspondences;
use crate::estimate::{compute_color_gradients, TransformationEstimator};
use crate::search::KdTree;
use alignkit_core::{Error, PointCloud, Result, Transform3D, Vector3f};
use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

/// Convergence thresholds and the iteration cap for a single solve.
///
/// Convergence is declared when the relative change of both fitness and rmse
/// between consecutive iterations drops below the thresholds, after at least
/// one prior iteration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConvergenceCriteria {
    pub relative_fitness: f32,
    pub relative_rmse: f32,
    pub max_iterations: usize,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            max_iterations: 30,
        }
    }
}

impl ConvergenceCriteria {
    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidArgument(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.relative_fitness < 0.0 || self.relative_rmse < 0.0 {
            return Err(Error::InvalidArgument(
                "relative thresholds must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Solver state.
///
/// `Converged` and `MaxIterationsReached` are terminal; reaching the
/// iteration cap is a normal outcome, not an error; callers judge quality
/// from fitness and rmse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcpState {
    Initializing,
    Iterating,
    Converged,
    MaxIterationsReached,
}

impl IcpState {
    /// Whether the solver has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::MaxIterationsReached)
    }
}

/// Outcome of a registration solve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResult {
    /// Source-to-target rigid transformation
    pub transformation: Isometry3<f32>,
    /// Fraction of source points with an accepted correspondence
    pub fitness: f32,
    /// Root-mean-square residual over accepted correspondences
    pub inlier_rmse: f32,
    /// Number of iterations performed
    pub iterations: usize,
    /// Terminal state the solve ended in
    pub state: IcpState,
}

/// Single-level ICP driver.
///
/// The loop is an explicit state machine: each [`step`](IcpSolver::step)
/// transforms the source by the cumulative estimate, searches
/// correspondences, solves for an increment, composes it, and checks
/// convergence. Driving the machine one step at a time keeps cancellation
/// trivial (stop calling `step`), while [`run`](IcpSolver::run) drives it to
/// a terminal state.
#[derive(Debug)]
pub struct IcpSolver<'a> {
    source: &'a PointCloud,
    target: &'a PointCloud,
    estimator: TransformationEstimator,
    criteria: ConvergenceCriteria,
    max_correspondence_distance: f32,
    target_index: KdTree,
    color_gradients: Option<Vec<Vector3f>>,
    cumulative: Isometry3<f32>,
    state: IcpState,
    iteration: usize,
    prev_fitness: f32,
    prev_rmse: f32,
    fitness: f32,
    rmse: f32,
}

impl<'a> IcpSolver<'a> {
    /// Set up a solve.
    ///
    /// Validates arguments and the estimator's attribute requirements, builds
    /// the spatial index on the target, and precomputes the color gradient
    /// field when the colored variant is selected.
    pub fn new(
        source: &'a PointCloud,
        target: &'a PointCloud,
        max_correspondence_distance: f32,
        init: Isometry3<f32>,
        estimator: TransformationEstimator,
        criteria: ConvergenceCriteria,
    ) -> Result<Self> {
        if source.is_empty() || target.is_empty() {
            return Err(Error::InvalidArgument(
                "source and target clouds must be non-empty".to_string(),
            ));
        }
        if !(max_correspondence_distance > 0.0) || !max_correspondence_distance.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "max_correspondence_distance must be positive, got {max_correspondence_distance}"
            )));
        }
        criteria.validate()?;
        estimator.validate(source, target)?;

        let target_index = KdTree::build(target.positions());
        let color_gradients = if estimator.requires_colors() {
            Some(compute_color_gradients(
                target,
                &target_index,
                2.0 * max_correspondence_distance,
                30,
            )?)
        } else {
            None
        };

        Ok(Self {
            source,
            target,
            estimator,
            criteria,
            max_correspondence_distance,
            target_index,
            color_gradients,
            cumulative: init,
            state: IcpState::Initializing,
            iteration: 0,
            prev_fitness: 0.0,
            prev_rmse: 0.0,
            fitness: 0.0,
            rmse: 0.0,
        })
    }

    /// Current solver state
    pub fn state(&self) -> IcpState {
        self.state
    }

    /// Current cumulative transformation
    pub fn transformation(&self) -> Isometry3<f32> {
        self.cumulative
    }

    /// Iterations performed so far
    pub fn iterations(&self) -> usize {
        self.iteration
    }

    /// Perform one iteration and return the new state.
    ///
    /// Calling `step` in a terminal state is a no-op. The only fatal
    /// condition is zero correspondences on the very first iteration; running
    /// out of correspondences later terminates with the last estimate.
    pub fn step(&mut self) -> Result<IcpState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }

        let current = self.source.transformed(&Transform3D::from(self.cumulative));
        let correspondences = find_correspondences(
            current.positions(),
            &self.target_index,
            self.max_correspondence_distance,
        );

        if correspondences.is_empty() {
            if self.iteration == 0 {
                return Err(Error::NoCorrespondences);
            }
            log::debug!(
                "icp: correspondences exhausted at iteration {}, stopping",
                self.iteration
            );
            self.state = IcpState::Converged;
            return Ok(self.state);
        }

        let estimate = self.estimator.estimate_increment(
            &current,
            self.target,
            &correspondences,
            self.color_gradients.as_deref(),
        )?;

        self.cumulative = estimate.transform * self.cumulative;
        // quaternion composition keeps the rotation orthonormal; renormalize
        // to shed the residual drift of long iteration chains
        self.cumulative.rotation.renormalize();

        let had_previous = self.state == IcpState::Iterating;
        let delta_fitness = (estimate.fitness - self.prev_fitness).abs();
        let delta_rmse = (estimate.rmse - self.prev_rmse).abs();

        self.iteration += 1;
        self.prev_fitness = estimate.fitness;
        self.prev_rmse = estimate.rmse;
        self.fitness = estimate.fitness;
        self.rmse = estimate.rmse;

        log::debug!(
            "icp: iteration {} fitness {:.6} rmse {:.6}",
            self.iteration,
            self.fitness,
            self.rmse
        );

        self.state = if had_previous
            && delta_fitness < self.criteria.relative_fitness
            && delta_rmse < self.criteria.relative_rmse
        {
            IcpState::Converged
        } else if self.iteration >= self.criteria.max_iterations {
            IcpState::MaxIterationsReached
        } else {
            IcpState::Iterating
        };
        Ok(self.state)
    }

    /// Drive the solve to a terminal state
    pub fn run(&mut self) -> Result<RegistrationResult> {
        while !self.state.is_terminal() {
            self.step()?;
        }
        Ok(self.result())
    }

    /// Snapshot of the current result
    pub fn result(&self) -> RegistrationResult {
        RegistrationResult {
            transformation: self.cumulative,
            fitness: self.fitness,
            inlier_rmse: self.rmse,
            iterations: self.iteration,
            state: self.state,
        }
    }
}

/// Register `source` against `target` with a single ICP solve.
///
/// Convenience wrapper over [`IcpSolver`]; see the solver for the state
/// machine and failure modes.
///
/// # Arguments
/// * `source` - Cloud to be aligned
/// * `target` - Cloud to align to
/// * `max_correspondence_distance` - Matches farther than this are rejected
/// * `init` - Initial transformation guess
/// * `estimator` - Residual model to minimize
/// * `criteria` - Convergence thresholds and iteration cap
pub fn registration_icp(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f32,
    init: Isometry3<f32>,
    estimator: TransformationEstimator,
    criteria: ConvergenceCriteria,
) -> Result<RegistrationResult> {
    IcpSolver::new(
        source,
        target,
        max_correspondence_distance,
        init,
        estimator,
        criteria,
    )?
    .run()
}

/// Evaluate how well a fixed transformation aligns `source` to `target`.
///
/// No iteration is performed; the result carries the given transformation,
/// the fitness under `max_correspondence_distance`, and the Euclidean inlier
/// rmse. Zero matches yield zero fitness, not an error.
pub fn evaluate_registration(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f32,
    transformation: Isometry3<f32>,
) -> Result<RegistrationResult> {
    if source.is_empty() || target.is_empty() {
        return Err(Error::InvalidArgument(
            "source and target clouds must be non-empty".to_string(),
        ));
    }
    if !(max_correspondence_distance > 0.0) || !max_correspondence_distance.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "max_correspondence_distance must be positive, got {max_correspondence_distance}"
        )));
    }

    let target_index = KdTree::build(target.positions());
    let current = source.transformed(&Transform3D::from(transformation));
    let correspondences = find_correspondences(
        current.positions(),
        &target_index,
        max_correspondence_distance,
    );

    let (fitness, rmse) = if correspondences.is_empty() {
        (0.0, 0.0)
    } else {
        let residual_sq: f64 = correspondences
            .iter()
            .map(|c| c.distance_sq as f64)
            .sum();
        (
            correspondences.len() as f32 / source.len() as f32,
            (residual_sq / correspondences.len() as f64).sqrt() as f32,
        )
    };

    Ok(RegistrationResult {
        transformation,
        fitness,
        inlier_rmse: rmse,
        iterations: 0,
        state: IcpState::Converged,
    })
}
