//! Handler that owns the SQP subproblems.
//!
//! One handler instance owns one back-end configured either as the
//! ℓ₁-penalty QP or as the feasibility LP.  In the plain formulation the QP
//! decision vector is `(p, u, v)` with penalty variables `u, v >= 0` and the
//! constraint matrix `[J | I | -I]`; the slack formulation appends `(w, t)`
//! and mirrors the variable bounds as constraint rows `[I | 0 | 0 | I | -I]`
//! so they may be violated at the same ℓ₁ price.
//!
//! A dirty-data tracker records which parts of the QP changed since the last
//! solve; only those are re-shipped to the back-end.

use std::path::{Path, PathBuf};

use faer::Col;

use crate::linalg::harwell_boeing::{HarwellBoeingMatrix, IdentityMatrixPositions};
use crate::linalg::triplet::SparseTripletMatrix;
use crate::linalg::vector_ops;
use crate::options::SqpOptions;
use crate::qp::active_set::DenseActiveSetQp;
use crate::qp::working_set::ActivityStatus;
use crate::qp::{QpSolverInterface, QpStatus, QpType};
use crate::stats::Statistics;
use crate::{E, I, SQP_INFINITY, SqpError};

/// Tracks which parts of the QP data changed since they were last shipped
/// to the back-end.
#[derive(Debug, Clone, Copy, Default)]
pub struct QpUpdateTracker {
    gradient: bool,
    penalty_parameter: bool,
    bounds: bool,
    trust_region_decrease: bool,
    jacobian: bool,
    hessian: bool,
}

impl QpUpdateTracker {
    pub fn trigger_gradient_update(&mut self) {
        self.gradient = true;
    }

    pub fn trigger_penalty_parameter_update(&mut self) {
        self.penalty_parameter = true;
    }

    pub fn trigger_bounds_update(&mut self) {
        self.bounds = true;
    }

    pub fn trigger_trust_region_radius_decrease(&mut self) {
        self.trust_region_decrease = true;
    }

    pub fn trigger_jacobian_update(&mut self) {
        self.jacobian = true;
    }

    pub fn trigger_hessian_update(&mut self) {
        self.hessian = true;
    }

    pub fn trigger_all_updates(&mut self) {
        self.gradient = true;
        self.penalty_parameter = true;
        self.bounds = true;
        self.jacobian = true;
        self.hessian = true;
    }

    pub fn need_update(&self) -> bool {
        self.gradient
            || self.penalty_parameter
            || self.bounds
            || self.trust_region_decrease
            || self.jacobian
            || self.hessian
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// All NLP-level quantities needed to form the subproblem.
pub struct QpInputs<'a> {
    pub trust_region_radius: E,
    pub penalty_parameter: E,
    pub lower_variable_bounds: &'a Col<E>,
    pub upper_variable_bounds: &'a Col<E>,
    pub current_iterate: &'a Col<E>,
    pub lower_constraint_bounds: &'a Col<E>,
    pub upper_constraint_bounds: &'a Col<E>,
    /// Constraint body the linearization is taken at (`c_k`, or `c_k + J p`
    /// for a second-order correction).
    pub constraint_body: &'a Col<E>,
    pub objective_gradient: &'a Col<E>,
    pub constraint_jacobian: &'a SparseTripletMatrix,
    /// Absent for the feasibility LP.
    pub lagrangian_hessian: Option<&'a SparseTripletMatrix>,
}

/// Builds and solves the ℓ₁-penalty QP (or feasibility LP) for the engine.
pub struct QpHandler {
    qp_type: QpType,
    slack_formulation: bool,
    num_nlp_variables: I,
    num_nlp_constraints: I,
    num_qp_variables: I,
    num_qp_constraints: I,

    backend: DenseActiveSetQp,
    tracker: QpUpdateTracker,
    initialized: bool,

    /// Constraint matrix in the back-end's orientation; structure is laid
    /// out on the first Jacobian update.
    qp_jacobian: Option<HarwellBoeingMatrix>,
    /// Hessian embedded into the QP variable space.
    qp_hessian: Option<SparseTripletMatrix>,
    identity_positions: IdentityMatrixPositions,

    /// Copies of the current QP row bounds, used to seed a feasible start.
    row_lower: Col<E>,
    row_upper: Col<E>,

    last_penalty_parameter: E,
    last_kkt_error: E,
    dump_file: PathBuf,
}

impl QpHandler {
    pub fn new(
        qp_type: QpType,
        num_nlp_variables: I,
        num_nlp_constraints: I,
        slack_formulation: bool,
        problem_name: &str,
        options: &SqpOptions,
    ) -> Self {
        let (num_qp_variables, num_qp_constraints) = if slack_formulation {
            (
                3 * num_nlp_variables + 2 * num_nlp_constraints,
                num_nlp_constraints + num_nlp_variables,
            )
        } else {
            (
                num_nlp_variables + 2 * num_nlp_constraints,
                num_nlp_constraints,
            )
        };

        // Identity blocks of the constraint matrix.
        let mut identity_positions = IdentityMatrixPositions::new();
        // Positive and negative penalty variables for the constraints.
        identity_positions.add_matrix(0, num_nlp_variables, num_nlp_constraints, 1.);
        identity_positions.add_matrix(
            0,
            num_nlp_variables + num_nlp_constraints,
            num_nlp_constraints,
            -1.,
        );
        if slack_formulation {
            // Rows that mirror the variable bounds, with their own slacks.
            identity_positions.add_matrix(num_nlp_constraints, 0, num_nlp_variables, 1.);
            identity_positions.add_matrix(
                num_nlp_constraints,
                num_nlp_variables + 2 * num_nlp_constraints,
                num_nlp_variables,
                1.,
            );
            identity_positions.add_matrix(
                num_nlp_constraints,
                2 * num_nlp_variables + 2 * num_nlp_constraints,
                num_nlp_variables,
                -1.,
            );
        }

        let max_iterations = match qp_type {
            QpType::Qp => options.qp_solver_max_num_iterations,
            QpType::Lp => options.lp_solver_max_num_iterations,
        };
        let mut backend = DenseActiveSetQp::new(
            qp_type,
            num_qp_variables,
            num_qp_constraints,
            max_iterations,
            options.qp_hessian_regularization,
            options.qp_init_primal_variables,
        );

        // Bounds of the penalty and slack variables never change.
        for i in num_nlp_variables..num_qp_variables {
            backend.set_lower_variable_bound(i, 0.);
            backend.set_upper_variable_bound(i, SQP_INFINITY);
        }

        let suffix = match qp_type {
            QpType::Qp => "qpdata.log",
            QpType::Lp => "lpdata.log",
        };
        let name = problem_name.rsplit(['/', '\\']).next().unwrap_or("");
        let dump_file = PathBuf::from(format!("{name}{suffix}"));

        Self {
            qp_type,
            slack_formulation,
            num_nlp_variables,
            num_nlp_constraints,
            num_qp_variables,
            num_qp_constraints,
            backend,
            tracker: QpUpdateTracker::default(),
            initialized: false,
            qp_jacobian: None,
            qp_hessian: None,
            identity_positions,
            row_lower: Col::zeros(num_qp_constraints),
            row_upper: Col::zeros(num_qp_constraints),
            last_penalty_parameter: -1.,
            last_kkt_error: 0.,
            dump_file,
        }
    }

    pub fn num_qp_variables(&self) -> I {
        self.num_qp_variables
    }

    pub fn tracker_mut(&mut self) -> &mut QpUpdateTracker {
        &mut self.tracker
    }

    /// Forwards a user-provided initial working set to the back-end.  The
    /// penalty variables are marked active at their lower bound.
    pub fn set_initial_working_sets(
        &mut self,
        bounds_working_set: &[ActivityStatus],
        constraints_working_set: &[ActivityStatus],
    ) {
        debug_assert!(!self.slack_formulation);
        let mut qp_bounds = vec![ActivityStatus::ActiveBelow; self.num_qp_variables];
        qp_bounds[..self.num_nlp_variables].copy_from_slice(bounds_working_set);
        self.backend
            .set_initial_working_sets(&qp_bounds, constraints_working_set);
    }

    fn set_bounds(&mut self, inputs: &QpInputs<'_>) {
        let n = self.num_nlp_variables;
        let m = self.num_nlp_constraints;
        let delta = inputs.trust_region_radius;

        if !self.slack_formulation {
            for i in 0..n {
                let lower = inputs.lower_variable_bounds[i] - inputs.current_iterate[i];
                let upper = inputs.upper_variable_bounds[i] - inputs.current_iterate[i];
                self.backend.set_lower_variable_bound(i, lower.max(-delta));
                self.backend.set_upper_variable_bound(i, upper.min(delta));
            }
        } else {
            // The step is only limited by the trust region; the variable
            // bounds appear as penalized rows below.
            for i in 0..n {
                self.backend.set_lower_variable_bound(i, -delta);
                self.backend.set_upper_variable_bound(i, delta);
            }
        }

        for j in 0..m {
            self.row_lower[j] = inputs.lower_constraint_bounds[j] - inputs.constraint_body[j];
            self.row_upper[j] = inputs.upper_constraint_bounds[j] - inputs.constraint_body[j];
            self.backend.set_lower_constraint_bound(j, self.row_lower[j]);
            self.backend.set_upper_constraint_bound(j, self.row_upper[j]);
        }
        if self.slack_formulation {
            for i in 0..n {
                self.row_lower[m + i] =
                    inputs.lower_variable_bounds[i] - inputs.current_iterate[i];
                self.row_upper[m + i] =
                    inputs.upper_variable_bounds[i] - inputs.current_iterate[i];
                self.backend
                    .set_lower_constraint_bound(m + i, self.row_lower[m + i]);
                self.backend
                    .set_upper_constraint_bound(m + i, self.row_upper[m + i]);
            }
        }
    }

    /// Shrinks the step bounds to a smaller trust-region radius without
    /// regenerating the full bound vectors.
    fn decrease_trust_region(&mut self, trust_region_radius: E) {
        for i in 0..self.num_nlp_variables {
            if self.slack_formulation {
                self.backend.set_lower_variable_bound(i, -trust_region_radius);
                self.backend.set_upper_variable_bound(i, trust_region_radius);
            } else {
                if self.backend.get_lower_variable_bound(i) < -trust_region_radius {
                    self.backend.set_lower_variable_bound(i, -trust_region_radius);
                }
                if self.backend.get_upper_variable_bound(i) > trust_region_radius {
                    self.backend.set_upper_variable_bound(i, trust_region_radius);
                }
            }
        }
    }

    fn set_gradient(&mut self, inputs: &QpInputs<'_>) {
        match self.qp_type {
            QpType::Qp => {
                for i in 0..self.num_nlp_variables {
                    self.backend
                        .set_linear_objective_coefficient(i, inputs.objective_gradient[i]);
                }
                self.set_penalty_parameter(inputs.penalty_parameter);
            }
            QpType::Lp => {
                // The LP objective is the plain sum of the penalty
                // variables; it is set once and never changes.
                for i in 0..self.num_nlp_variables {
                    self.backend.set_linear_objective_coefficient(i, 0.);
                }
                self.set_penalty_parameter(1.);
            }
        }
    }

    fn set_penalty_parameter(&mut self, penalty_parameter: E) {
        if penalty_parameter != self.last_penalty_parameter {
            for i in self.num_nlp_variables..self.num_qp_variables {
                self.backend
                    .set_linear_objective_coefficient(i, penalty_parameter);
            }
            self.last_penalty_parameter = penalty_parameter;
        }
    }

    fn set_jacobian(&mut self, jacobian: &SparseTripletMatrix) {
        match &mut self.qp_jacobian {
            Some(qp_jacobian) => qp_jacobian.update_values(jacobian.values()),
            None => {
                let qp_jacobian = HarwellBoeingMatrix::from_structure(
                    self.backend.preferred_orientation(),
                    self.num_qp_constraints,
                    self.num_qp_variables,
                    jacobian.row_indices(),
                    jacobian.col_indices(),
                    &self.identity_positions,
                )
                .expect("Jacobian structure does not fit the QP dimensions");
                let mut qp_jacobian = qp_jacobian;
                qp_jacobian.update_values(jacobian.values());
                self.qp_jacobian = Some(qp_jacobian);
            }
        }
        self.backend
            .set_constraint_jacobian(self.qp_jacobian.as_ref().unwrap());
    }

    fn set_hessian(&mut self, hessian: &SparseTripletMatrix) {
        match &mut self.qp_hessian {
            Some(qp_hessian) => qp_hessian.set_values(hessian.values()),
            None => {
                let mut qp_hessian = SparseTripletMatrix::new(
                    self.num_qp_variables,
                    self.num_qp_variables,
                    hessian.row_indices().to_vec(),
                    hessian.col_indices().to_vec(),
                    true,
                )
                .expect("Hessian structure does not fit the QP dimensions");
                qp_hessian.set_values(hessian.values());
                self.qp_hessian = Some(qp_hessian);
            }
        }
        self.backend
            .set_objective_hessian(self.qp_hessian.as_ref().unwrap());
    }

    /// Ships changed data to the back-end, per the dirty tracker.  The
    /// first call ships everything and fixes the matrix structures.
    pub fn setup(&mut self, inputs: &QpInputs<'_>) {
        if !self.initialized {
            self.set_jacobian(inputs.constraint_jacobian);
            if let Some(hessian) = inputs.lagrangian_hessian {
                self.set_hessian(hessian);
            }
            self.set_bounds(inputs);
            self.set_gradient(inputs);
            self.tracker.reset();
            self.initialized = true;
            return;
        }

        if inputs.penalty_parameter != self.last_penalty_parameter
            && self.qp_type == QpType::Qp
        {
            self.tracker.trigger_penalty_parameter_update();
        }
        debug_assert!(self.tracker.need_update(), "QP data has not changed");

        if self.tracker.jacobian {
            self.set_jacobian(inputs.constraint_jacobian);
        }
        if self.tracker.hessian {
            if let Some(hessian) = inputs.lagrangian_hessian {
                self.set_hessian(hessian);
            }
        }
        if self.tracker.bounds {
            self.set_bounds(inputs);
        } else if self.tracker.trust_region_decrease {
            self.decrease_trust_region(inputs.trust_region_radius);
        }
        if self.tracker.gradient {
            self.set_gradient(inputs);
        } else if self.tracker.penalty_parameter {
            self.set_penalty_parameter(inputs.penalty_parameter);
        }

        self.tracker.reset();
    }

    /// Re-ships bounds and Jacobian for the feasibility LP; its objective
    /// never changes.
    pub fn setup_feasibility_lp(&mut self, inputs: &QpInputs<'_>) {
        debug_assert_eq!(self.qp_type, QpType::Lp);
        if !self.initialized {
            self.setup(inputs);
            return;
        }
        self.set_bounds(inputs);
        self.set_jacobian(inputs.constraint_jacobian);
        self.tracker.reset();
    }

    /// A primal point that satisfies all QP constraints: zero step, with
    /// the penalty variables absorbing the current violation.
    fn feasible_start(&self) -> Col<E> {
        let n = self.num_nlp_variables;
        let m = self.num_nlp_constraints;
        let mut start = Col::zeros(self.num_qp_variables);
        for j in 0..m {
            start[n + j] = self.row_lower[j].max(0.);
            start[n + m + j] = (-self.row_upper[j]).max(0.);
        }
        if self.slack_formulation {
            for i in 0..self.num_nlp_variables {
                start[n + 2 * m + i] = self.row_lower[m + i].max(0.);
                start[2 * n + 2 * m + i] = (-self.row_upper[m + i]).max(0.);
            }
        }
        start
    }

    /// Solves the subproblem.  On failure the QP data is written to disk
    /// for reproduction and a typed fatal error is raised.
    pub fn solve(&mut self, stats: &mut Statistics) -> Result<(), SqpError> {
        let start = self.feasible_start();
        self.backend.set_initial_primal(start.as_ref());

        let status = self.backend.optimize(stats);
        match status {
            QpStatus::Optimal => {
                self.last_kkt_error = self.backend.calc_kkt_error().worst_violation;
                Ok(())
            }
            failure => {
                let _ = self.backend.write_qp_data_to_file(&self.dump_file);
                Err(match failure {
                    QpStatus::Infeasible => SqpError::QpInfeasible,
                    QpStatus::Unbounded => SqpError::QpUnbounded,
                    QpStatus::IterLimit => SqpError::QpIterLimit,
                    QpStatus::InternalError | QpStatus::Failed => SqpError::QpInternalError,
                    QpStatus::Uninitialized | QpStatus::NotSolved => SqpError::QpNotInitialized,
                    QpStatus::Unknown | QpStatus::Optimal => SqpError::QpUnknown,
                })
            }
        }
    }

    /// The step `p` (the first `n` components of the QP solution).
    pub fn get_primal_step(&self) -> Col<E> {
        vector_ops::subvector(
            self.backend.get_primal_solution().as_ref(),
            0,
            self.num_nlp_variables,
        )
    }

    /// Violation of the linearized constraints at the QP solution, read off
    /// the penalty variables.
    pub fn get_model_infeasibility(&self) -> E {
        vector_ops::subvector_one_norm(
            self.backend.get_primal_solution().as_ref(),
            self.num_nlp_variables,
            self.num_qp_variables - self.num_nlp_variables,
        )
    }

    pub fn get_qp_objective(&self) -> E {
        self.backend.get_optimal_objective_value()
    }

    pub fn get_qp_kkt_error(&self) -> E {
        self.last_kkt_error
    }

    pub fn get_num_qp_iterations(&self) -> I {
        self.backend.get_num_iterations()
    }

    /// Bound multipliers restricted to the NLP variables.
    pub fn get_bounds_multipliers(&self) -> Col<E> {
        let n = self.num_nlp_variables;
        let m = self.num_nlp_constraints;
        if self.slack_formulation {
            // The variable bounds live in the mirrored rows.
            vector_ops::subvector(self.backend.get_constraint_multipliers().as_ref(), m, n)
        } else {
            vector_ops::subvector(self.backend.get_bounds_multipliers().as_ref(), 0, n)
        }
    }

    /// Constraint multipliers restricted to the NLP constraints.
    pub fn get_constraint_multipliers(&self) -> Col<E> {
        vector_ops::subvector(
            self.backend.get_constraint_multipliers().as_ref(),
            0,
            self.num_nlp_constraints,
        )
    }

    pub fn get_bounds_working_set(&self) -> Vec<ActivityStatus> {
        let n = self.num_nlp_variables;
        let m = self.num_nlp_constraints;
        if self.slack_formulation {
            self.backend.get_constraints_working_set()[m..m + n].to_vec()
        } else {
            self.backend.get_bounds_working_set()[..n].to_vec()
        }
    }

    pub fn get_constraints_working_set(&self) -> Vec<ActivityStatus> {
        self.backend.get_constraints_working_set()[..self.num_nlp_constraints].to_vec()
    }

    pub fn get_solver_status(&self) -> QpStatus {
        self.backend.get_solver_status()
    }

    pub fn write_qp_data(&self, path: &Path) -> Result<(), problemo::Problem> {
        self.backend.write_qp_data_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Options, SqpOptions};

    fn default_options() -> SqpOptions {
        SqpOptions::from_options(&Options::new()).unwrap()
    }

    fn col(data: &[E]) -> Col<E> {
        Col::from_fn(data.len(), |i| data[i])
    }

    /// One linear constraint `0 <= x1 + x2 <= 1` at `x_k = (2, 2)` with
    /// c_k = 4: the violated row forces the penalty variables to absorb
    /// what the step cannot reach within the trust region.
    #[test]
    fn test_penalty_variables_absorb_violation() {
        let options = default_options();
        let mut handler = QpHandler::new(QpType::Qp, 2, 1, false, "test", &options);

        let mut hessian = SparseTripletMatrix::new(2, 2, vec![0, 1], vec![0, 1], true).unwrap();
        hessian.set_values(&[1., 1.]);
        let mut jacobian =
            SparseTripletMatrix::new(1, 2, vec![0, 0], vec![0, 1], false).unwrap();
        jacobian.set_values(&[1., 1.]);

        let x_l = col(&[-10., -10.]);
        let x_u = col(&[10., 10.]);
        let x_k = col(&[2., 2.]);
        let c_l = col(&[0.]);
        let c_u = col(&[1.]);
        let c_k = col(&[4.]);
        let gradient = col(&[0., 0.]);

        let inputs = QpInputs {
            trust_region_radius: 1.,
            penalty_parameter: 10.,
            lower_variable_bounds: &x_l,
            upper_variable_bounds: &x_u,
            current_iterate: &x_k,
            lower_constraint_bounds: &c_l,
            upper_constraint_bounds: &c_u,
            constraint_body: &c_k,
            objective_gradient: &gradient,
            constraint_jacobian: &jacobian,
            lagrangian_hessian: Some(&hessian),
        };

        handler.setup(&inputs);
        let mut stats = Statistics::new();
        handler.solve(&mut stats).unwrap();

        // Within the trust region the step can reduce the violation of
        // c + J p in [-4, -3] by at most 2, leaving model infeasibility 1.
        let p = handler.get_primal_step();
        assert!((p[0] + 1.).abs() < 1e-6);
        assert!((p[1] + 1.).abs() < 1e-6);
        assert!((handler.get_model_infeasibility() - 1.).abs() < 1e-6);
        assert!(handler.get_qp_kkt_error() < 1e-6);
    }

    /// The feasibility LP of the same subproblem measures the best
    /// achievable linearized violation.
    #[test]
    fn test_feasibility_lp_matches_best_violation() {
        let options = default_options();
        let mut handler = QpHandler::new(QpType::Lp, 2, 1, false, "test", &options);

        let mut jacobian =
            SparseTripletMatrix::new(1, 2, vec![0, 0], vec![0, 1], false).unwrap();
        jacobian.set_values(&[1., 1.]);

        let x_l = col(&[-10., -10.]);
        let x_u = col(&[10., 10.]);
        let x_k = col(&[2., 2.]);
        let c_l = col(&[0.]);
        let c_u = col(&[1.]);
        let c_k = col(&[4.]);
        let gradient = col(&[0., 0.]);

        let inputs = QpInputs {
            trust_region_radius: 1.,
            penalty_parameter: 1.,
            lower_variable_bounds: &x_l,
            upper_variable_bounds: &x_u,
            current_iterate: &x_k,
            lower_constraint_bounds: &c_l,
            upper_constraint_bounds: &c_u,
            constraint_body: &c_k,
            objective_gradient: &gradient,
            constraint_jacobian: &jacobian,
            lagrangian_hessian: None,
        };

        handler.setup_feasibility_lp(&inputs);
        let mut stats = Statistics::new();
        handler.solve(&mut stats).unwrap();
        assert!((handler.get_model_infeasibility() - 1.).abs() < 1e-6);
    }

    #[test]
    fn test_tracker_round_trip() {
        let mut tracker = QpUpdateTracker::default();
        assert!(!tracker.need_update());
        tracker.trigger_bounds_update();
        assert!(tracker.need_update());
        tracker.reset();
        assert!(!tracker.need_update());
        tracker.trigger_all_updates();
        assert!(tracker.need_update());
    }
}
