// Least-squares solver using Levenberg-Marquardt optimization
//
// Minimizes sum_i w_i * r_i(x)^2 over a parameter vector x, given analytic
// residuals and Jacobian from a LeastSquaresProblem. On success the solution
// carries the inverse weighted normal matrix (J^T W J)^-1, which is the
// parameter covariance used by the uncertainty propagator.

use nalgebra as na;
use na::{DMatrix, DVector};
use tracing::debug;

use crate::constants::{
    SOLVER_COST_EPSILON, SOLVER_COST_TOLERANCE, SOLVER_INITIAL_DAMPING, SOLVER_MAX_DAMPING_STEPS,
    SOLVER_MAX_ITERATIONS, SOLVER_PARAMETER_TOLERANCE,
};
use crate::error::{Error, Result};

const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e12;

/// Smallest ratio between the Cholesky pivots of the normal matrix before it is treated as singular.
const MIN_PIVOT_RATIO: f64 = 1e-7;

/// A nonlinear least-squares problem with analytic derivatives.
pub trait LeastSquaresProblem {
    /// Number of unknowns.
    fn num_parameters(&self) -> usize;

    /// Number of residual rows.
    fn num_residuals(&self) -> usize;

    /// Residuals r(x) (observed - predicted).
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Jacobian dr/dx, one row per residual.
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64>;

    /// Weight of each residual row (inverse variance).
    fn weights(&self) -> DVector<f64>;
}

/// Solver state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    Unsolved,
    Iterating,
    Converged,
    /// Iteration cap reached; the best parameters found are still returned
    MaxIterations,
    Failed,
}

/// Result of a successful solve.
#[derive(Debug, Clone)]
pub struct Solution {
    pub parameters: DVector<f64>,
    /// (J^T W J)^-1 at the solution
    pub covariance: DMatrix<f64>,
    /// Jacobian at the solution
    pub jacobian: DMatrix<f64>,
    pub residuals: DVector<f64>,
    pub weights: DVector<f64>,
    /// sum_i w_i r_i^2 at the solution
    pub chi_square: f64,
    pub iterations: usize,
    /// False when the iteration cap was reached first
    pub converged: bool,
}

/// Levenberg-Marquardt solver with Marquardt (diagonal) damping.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    max_iterations: usize,
    parameter_tolerance: f64,
    cost_tolerance: f64,
    status: SolverStatus,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self {
            max_iterations: SOLVER_MAX_ITERATIONS,
            parameter_tolerance: SOLVER_PARAMETER_TOLERANCE,
            cost_tolerance: SOLVER_COST_TOLERANCE,
            status: SolverStatus::Unsolved,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn status(&self) -> SolverStatus {
        self.status
    }

    /// Fit the problem starting from `initial_guess`.
    ///
    /// # Returns
    /// * `Ok(Solution)` when converged, or when the iteration cap was reached
    ///   (`converged == false`, status `MaxIterations`)
    /// * `Err(NotEnoughReadings)` if there are fewer residuals than unknowns
    /// * `Err(NonFiniteCost)` if the residuals or weights yield a NaN or infinite cost
    /// * `Err(SingularNormalEquations)` if J^T W J cannot be inverted at the solution
    pub fn solve<P: LeastSquaresProblem>(
        &mut self,
        problem: &P,
        initial_guess: &DVector<f64>,
    ) -> Result<Solution> {
        let n_params = problem.num_parameters();
        let n_residuals = problem.num_residuals();
        if n_residuals < n_params || n_params == 0 {
            self.status = SolverStatus::Failed;
            return Err(Error::NotEnoughReadings {
                rows: n_residuals,
                unknowns: n_params,
            });
        }

        self.status = SolverStatus::Iterating;
        let weights = problem.weights();
        let sqrt_weights = weights.map(f64::sqrt);

        let mut x = initial_guess.clone();
        let mut cost = weighted_cost(&problem.residuals(&x), &weights);
        if !cost.is_finite() {
            self.status = SolverStatus::Failed;
            return Err(Error::NonFiniteCost);
        }
        let mut lambda = SOLVER_INITIAL_DAMPING;
        let mut converged = false;
        let mut iterations = 0;

        for iter in 0..self.max_iterations {
            iterations = iter + 1;

            if cost <= SOLVER_COST_EPSILON {
                converged = true;
                break;
            }

            // Row-scaled system: J_w = sqrt(W) J, r_w = sqrt(W) r
            let residuals = problem.residuals(&x);
            let jw = scale_rows(&problem.jacobian(&x), &sqrt_weights);
            let rw = residuals.component_mul(&sqrt_weights);
            let jt = jw.transpose();
            let jtj = &jt * &jw;
            let jtr = &jt * &rw;

            let diag_floor = jtj.diagonal().max().max(1.0) * 1e-9;
            let mut accepted = false;

            for _damping_iter in 0..SOLVER_MAX_DAMPING_STEPS {
                // (J^T W J + lambda * diag(J^T W J)) dx = -J^T W r
                let mut damped = jtj.clone();
                for i in 0..n_params {
                    damped[(i, i)] += lambda * jtj[(i, i)].max(diag_floor);
                }

                let Some(cholesky) = damped.cholesky() else {
                    lambda = (lambda * 10.0).min(MAX_DAMPING);
                    continue;
                };
                let step = cholesky.solve(&(-&jtr));
                let x_new = &x + &step;
                let new_cost = weighted_cost(&problem.residuals(&x_new), &weights);

                if new_cost.is_finite() && new_cost < cost {
                    let small_step = step.norm()
                        <= self.parameter_tolerance * (x.norm() + self.parameter_tolerance);
                    let small_gain = cost - new_cost <= self.cost_tolerance * cost;

                    x = x_new;
                    cost = new_cost;
                    lambda = (lambda * 0.1).max(MIN_DAMPING);
                    accepted = true;
                    converged = small_step || small_gain;
                    break;
                }

                lambda *= 10.0;
                if lambda > MAX_DAMPING {
                    break;
                }
            }

            debug!(iteration = iterations, cost, lambda, accepted, "LM iteration");

            if !accepted {
                // No descent direction left: local minimum
                converged = true;
            }
            if converged {
                break;
            }
        }

        let jacobian = problem.jacobian(&x);
        let residuals = problem.residuals(&x);
        let jw = scale_rows(&jacobian, &sqrt_weights);
        let normal = jw.transpose() * &jw;

        let Some(covariance) = invert_normal_matrix(normal) else {
            self.status = SolverStatus::Failed;
            return Err(Error::SingularNormalEquations);
        };

        self.status = if converged {
            SolverStatus::Converged
        } else {
            SolverStatus::MaxIterations
        };

        Ok(Solution {
            chi_square: weighted_cost(&residuals, &weights),
            parameters: x,
            covariance,
            jacobian,
            residuals,
            weights,
            iterations,
            converged,
        })
    }
}

fn weighted_cost(residuals: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    residuals
        .iter()
        .zip(weights.iter())
        .map(|(r, w)| w * r * r)
        .sum()
}

fn scale_rows(matrix: &DMatrix<f64>, scale: &DVector<f64>) -> DMatrix<f64> {
    let mut scaled = matrix.clone();
    for (i, mut row) in scaled.row_iter_mut().enumerate() {
        row *= scale[i];
    }
    scaled
}

/// Inverse of a symmetric normal matrix, or `None` when it is (numerically) singular.
fn invert_normal_matrix(normal: DMatrix<f64>) -> Option<DMatrix<f64>> {
    let cholesky = normal.cholesky()?;
    let pivots = cholesky.l_dirty().diagonal();
    let max_pivot = pivots.max();
    if !(max_pivot > 0.0) || pivots.min() / max_pivot < MIN_PIVOT_RATIO {
        return None;
    }
    let inverse = cholesky.inverse();
    Some((&inverse + inverse.transpose()) * 0.5)
}
