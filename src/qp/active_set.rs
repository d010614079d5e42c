//! Dense primal active-set back-end for convex QPs and LPs.
//!
//! The method keeps the iterate feasible and a working set of linearly
//! independent active bounds and constraint rows.  Each iteration solves the
//! equality-constrained subproblem on the current face through a nullspace
//! basis: if the reduced step is zero, the working-set multipliers are
//! tested and a wrong-signed entry is dropped; otherwise the step is cut at
//! the nearest blocking constraint, which enters the working set.
//!
//! The reduced Hessian is factorized by a dense Cholesky; if that fails
//! (indefinite Lagrangian Hessian), a diagonal regularization is escalated
//! until it succeeds, which is the `qp_hessian_regularization` contract.  In
//! LP mode the reduced objective is linear and steps are rays that either
//! hit a blocking constraint or prove unboundedness.
//!
//! Starts that violate the constraint rows are repaired by an elastic
//! phase-1 LP solved with the same machinery.
//!
//! Multiplier sign convention: lower-active entries carry non-negative
//! multipliers, upper-active entries non-positive ones.

use std::path::Path;

use faer::{Col, ColRef, Mat};
use problemo::Problem;

use crate::kkt::{KktError, calc_kkt_error};
use crate::linalg::dense::{solve_llt, solve_lu};
use crate::linalg::harwell_boeing::{HarwellBoeingMatrix, StorageOrientation};
use crate::linalg::triplet::SparseTripletMatrix;
use crate::linalg::vector_ops;
use crate::qp::working_set::{ActivityStatus, translate_working_set};
use crate::qp::{QpSolverInterface, QpStatus, QpType};
use crate::stats::Statistics;
use crate::{E, I, SQP_INFINITY};

/// Relative tolerance for the linear-independence test of working-set rows.
const INDEPENDENCE_TOL: E = 1e-8;
/// Tolerance below which a reduced gradient or step counts as zero.
const STATIONARITY_TOL: E = 1e-10;
/// Tolerance for wrong-signed working-set multipliers.
const MULTIPLIER_TOL: E = 1e-9;
/// Tolerance for detecting that a value sits on a bound.
const ACTIVITY_TOL: E = 1e-8;
/// Tolerance on directional derivatives in the blocking-constraint search.
const DIRECTION_TOL: E = 1e-13;
/// Row violations larger than this trigger the phase-1 repair.
const FEASIBILITY_TOL: E = 1e-9;

/// One bound or constraint row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstraintId {
    Bound(I),
    Row(I),
}

#[derive(Debug, Clone, Copy)]
struct ActiveEntry {
    id: ConstraintId,
    /// `-1` lower side, `+1` upper side.
    side: i8,
    /// Equality entries are never dropped.
    is_equality: bool,
}

/// Dense primal active-set QP/LP solver.
pub struct DenseActiveSetQp {
    qp_type: QpType,
    num_variables: I,
    num_constraints: I,

    hessian: Mat<E>,
    jacobian: Mat<E>,
    gradient: Col<E>,
    lower_variable_bounds: Col<E>,
    upper_variable_bounds: Col<E>,
    lower_constraint_bounds: Col<E>,
    upper_constraint_bounds: Col<E>,
    hessian_set: bool,

    max_iterations: I,
    regularization: E,
    cold_start: bool,

    status: QpStatus,
    primal: Col<E>,
    bound_multipliers: Col<E>,
    constraint_multipliers: Col<E>,
    bounds_working_set: Vec<ActivityStatus>,
    constraints_working_set: Vec<ActivityStatus>,
    objective: E,
    iterations: I,

    initial_primal: Option<Col<E>>,
    initial_bounds_working_set: Option<Vec<ActivityStatus>>,
    initial_constraints_working_set: Option<Vec<ActivityStatus>>,

    allow_phase1: bool,
}

impl DenseActiveSetQp {
    pub fn new(
        qp_type: QpType,
        num_variables: I,
        num_constraints: I,
        max_iterations: I,
        regularization: E,
        cold_start: bool,
    ) -> Self {
        Self {
            qp_type,
            num_variables,
            num_constraints,
            hessian: Mat::zeros(num_variables, num_variables),
            jacobian: Mat::zeros(num_constraints, num_variables),
            gradient: Col::zeros(num_variables),
            lower_variable_bounds: Col::from_fn(num_variables, |_| -SQP_INFINITY),
            upper_variable_bounds: Col::from_fn(num_variables, |_| SQP_INFINITY),
            lower_constraint_bounds: Col::from_fn(num_constraints, |_| -SQP_INFINITY),
            upper_constraint_bounds: Col::from_fn(num_constraints, |_| SQP_INFINITY),
            hessian_set: false,
            max_iterations,
            regularization,
            cold_start,
            status: QpStatus::Uninitialized,
            primal: Col::zeros(num_variables),
            bound_multipliers: Col::zeros(num_variables),
            constraint_multipliers: Col::zeros(num_constraints),
            bounds_working_set: vec![ActivityStatus::Inactive; num_variables],
            constraints_working_set: vec![ActivityStatus::Inactive; num_constraints],
            objective: 0.,
            iterations: 0,
            initial_primal: None,
            initial_bounds_working_set: None,
            initial_constraints_working_set: None,
            allow_phase1: true,
        }
    }

    fn constraint_bounds(&self, id: ConstraintId) -> (E, E) {
        match id {
            ConstraintId::Bound(i) => {
                (self.lower_variable_bounds[i], self.upper_variable_bounds[i])
            }
            ConstraintId::Row(j) => (
                self.lower_constraint_bounds[j],
                self.upper_constraint_bounds[j],
            ),
        }
    }

    fn constraint_value(&self, id: ConstraintId, x: &Col<E>) -> E {
        match id {
            ConstraintId::Bound(i) => x[i],
            ConstraintId::Row(j) => {
                let mut value = 0.;
                for i in 0..self.num_variables {
                    value += self.jacobian[(j, i)] * x[i];
                }
                value
            }
        }
    }

    fn constraint_normal(&self, id: ConstraintId) -> Col<E> {
        match id {
            ConstraintId::Bound(i) => Col::from_fn(self.num_variables, |k| if k == i { 1. } else { 0. }),
            ConstraintId::Row(j) => Col::from_fn(self.num_variables, |k| self.jacobian[(j, k)]),
        }
    }

    /// Orthogonalizes `normal` against `basis`; pushes and reports true if
    /// the remainder is large enough to count as independent.
    fn try_extend_basis(basis: &mut Vec<Col<E>>, normal: &Col<E>) -> bool {
        let scale = vector_ops::inf_norm(normal.as_ref()).max(1.);
        let mut remainder = normal.clone();
        for q in basis.iter() {
            let coeff = vector_ops::inner_product(q.as_ref(), remainder.as_ref());
            vector_ops::axpy(-coeff, q.as_ref(), &mut remainder);
        }
        let norm = vector_ops::inner_product(remainder.as_ref(), remainder.as_ref()).sqrt();
        if norm <= INDEPENDENCE_TOL * scale {
            return false;
        }
        vector_ops::scale(&mut remainder, 1. / norm);
        basis.push(remainder);
        true
    }

    /// Completes the working-set basis to a full orthonormal basis; the
    /// added directions span the nullspace of the working-set normals.
    fn nullspace_basis(&self, working_basis: &[Col<E>]) -> Mat<E> {
        let n = self.num_variables;
        let dim = n - working_basis.len();
        let mut full: Vec<Col<E>> = working_basis.to_vec();
        let mut nullspace: Vec<Col<E>> = Vec::with_capacity(dim);
        for i in 0..n {
            if nullspace.len() == dim {
                break;
            }
            let unit = Col::from_fn(n, |k| if k == i { 1. } else { 0. });
            if Self::try_extend_basis(&mut full, &unit) {
                nullspace.push(full.last().unwrap().clone());
            }
        }
        Mat::from_fn(n, nullspace.len(), |i, j| nullspace[j][i])
    }

    /// Objective gradient at `x`: `g + H x` for a QP, `g` for an LP.
    fn objective_gradient(&self, x: &Col<E>) -> Col<E> {
        let mut gradient = self.gradient.clone();
        if self.qp_type == QpType::Qp {
            for i in 0..self.num_variables {
                let mut hx = 0.;
                for k in 0..self.num_variables {
                    hx += self.hessian[(i, k)] * x[k];
                }
                gradient[i] += hx;
            }
        }
        gradient
    }

    fn objective_value(&self, x: &Col<E>) -> E {
        let mut objective = vector_ops::inner_product(self.gradient.as_ref(), x.as_ref());
        if self.qp_type == QpType::Qp {
            for i in 0..self.num_variables {
                for k in 0..self.num_variables {
                    objective += 0.5 * x[i] * self.hessian[(i, k)] * x[k];
                }
            }
        }
        objective
    }

    /// Solves for the working-set multipliers from the stationarity system
    /// `A_Wᵀ λ_W = ∇obj(x)` through the Gram matrix of the normals.
    fn working_set_multipliers(&self, active: &[ActiveEntry], gradient: &Col<E>) -> Col<E> {
        let num_active = active.len();
        if num_active == 0 {
            return Col::zeros(0);
        }
        let normals: Vec<Col<E>> = active.iter().map(|e| self.constraint_normal(e.id)).collect();
        let gram = Mat::from_fn(num_active, num_active, |i, j| {
            vector_ops::inner_product(normals[i].as_ref(), normals[j].as_ref())
        });
        let rhs = Col::from_fn(num_active, |i| {
            vector_ops::inner_product(normals[i].as_ref(), gradient.as_ref())
        });
        match solve_llt(gram.as_ref(), &rhs) {
            Some(multipliers) => multipliers,
            None => solve_lu(gram.as_ref(), &rhs),
        }
    }

    /// Finds the largest feasible step along `d` from `x`, capped at
    /// `step_cap`.  Returns the step and the blocking constraint, if any.
    fn step_length(
        &self,
        x: &Col<E>,
        direction: &Col<E>,
        step_cap: E,
        bound_state: &[i8],
        row_state: &[i8],
    ) -> (E, Option<(ConstraintId, i8)>) {
        let mut step = step_cap;
        let mut blocking = None;

        let mut consider = |id: ConstraintId, value: E, slope: E| {
            if slope > DIRECTION_TOL {
                let (_, upper) = self.constraint_bounds(id);
                if upper < SQP_INFINITY {
                    let limit = ((upper - value) / slope).max(0.);
                    if limit < step {
                        step = limit;
                        blocking = Some((id, 1));
                    }
                }
            } else if slope < -DIRECTION_TOL {
                let (lower, _) = self.constraint_bounds(id);
                if lower > -SQP_INFINITY {
                    let limit = ((lower - value) / slope).max(0.);
                    if limit < step {
                        step = limit;
                        blocking = Some((id, -1));
                    }
                }
            }
        };

        for i in 0..self.num_variables {
            if bound_state[i] == 0 {
                consider(ConstraintId::Bound(i), x[i], direction[i]);
            }
        }
        for j in 0..self.num_constraints {
            if row_state[j] == 0 {
                let value = self.constraint_value(ConstraintId::Row(j), x);
                let mut slope = 0.;
                for i in 0..self.num_variables {
                    slope += self.jacobian[(j, i)] * direction[i];
                }
                consider(ConstraintId::Row(j), value, slope);
            }
        }

        (step, blocking)
    }

    /// Repairs an infeasible start by solving the elastic LP
    /// `min 1ᵀs  s.t.  lbA <= A x + S s <= ubA`, `s >= 0`, with one elastic
    /// column per violated row.
    fn restore_feasibility(&self, x: &Col<E>) -> Result<Col<E>, QpStatus> {
        let mut violated: Vec<(I, E)> = Vec::new();
        for j in 0..self.num_constraints {
            let value = self.constraint_value(ConstraintId::Row(j), x);
            let scale = 1.
                + self.lower_constraint_bounds[j]
                    .abs()
                    .min(SQP_INFINITY)
                    .max(self.upper_constraint_bounds[j].abs().min(SQP_INFINITY));
            if value < self.lower_constraint_bounds[j] - FEASIBILITY_TOL * scale {
                violated.push((j, self.lower_constraint_bounds[j] - value));
            } else if value > self.upper_constraint_bounds[j] + FEASIBILITY_TOL * scale {
                violated.push((j, self.upper_constraint_bounds[j] - value));
            }
        }
        if violated.is_empty() {
            return Ok(x.clone());
        }
        if !self.allow_phase1 {
            return Err(QpStatus::InternalError);
        }

        let n = self.num_variables;
        let num_elastic = violated.len();
        let mut phase1 = DenseActiveSetQp::new(
            QpType::Lp,
            n + num_elastic,
            self.num_constraints,
            self.max_iterations,
            0.,
            true,
        );
        phase1.allow_phase1 = false;

        for i in 0..n {
            phase1.set_lower_variable_bound(i, self.lower_variable_bounds[i]);
            phase1.set_upper_variable_bound(i, self.upper_variable_bounds[i]);
        }
        for (k, _) in violated.iter().enumerate() {
            phase1.set_lower_variable_bound(n + k, 0.);
            phase1.set_upper_variable_bound(n + k, SQP_INFINITY);
            phase1.set_linear_objective_coefficient(n + k, 1.);
        }
        for j in 0..self.num_constraints {
            phase1.set_lower_constraint_bound(j, self.lower_constraint_bounds[j]);
            phase1.set_upper_constraint_bound(j, self.upper_constraint_bounds[j]);
        }
        for j in 0..self.num_constraints {
            for i in 0..n {
                phase1.jacobian[(j, i)] = self.jacobian[(j, i)];
            }
        }
        let mut start = Col::zeros(n + num_elastic);
        for i in 0..n {
            start[i] = x[i];
        }
        for (k, &(j, deficit)) in violated.iter().enumerate() {
            phase1.jacobian[(j, n + k)] = deficit.signum();
            start[n + k] = deficit.abs();
        }
        phase1.set_initial_primal(start.as_ref());

        let mut scratch_stats = Statistics::new();
        let status = phase1.optimize(&mut scratch_stats);
        if status != QpStatus::Optimal {
            return Err(status);
        }
        let residual = vector_ops::subvector_one_norm(
            phase1.primal.as_ref(),
            n,
            num_elastic,
        );
        if residual > 1e-7 {
            return Err(QpStatus::Infeasible);
        }
        Ok(vector_ops::subvector(phase1.primal.as_ref(), 0, n))
    }

    /// Chooses the starting point and working set for this solve.
    fn starting_point(
        &mut self,
    ) -> Result<(Col<E>, Vec<ActiveEntry>, Vec<i8>, Vec<i8>, Vec<Col<E>>), QpStatus> {
        let mut x = match self.initial_primal.take() {
            Some(x0) => x0,
            None => self.primal.clone(),
        };
        vector_ops::clip_to_bounds(
            &mut x,
            self.lower_variable_bounds.as_ref(),
            self.upper_variable_bounds.as_ref(),
        );
        x = self.restore_feasibility(&x)?;

        let requested_bounds = self.initial_bounds_working_set.take();
        let requested_rows = self.initial_constraints_working_set.take();

        let mut active: Vec<ActiveEntry> = Vec::new();
        let mut bound_state = vec![0i8; self.num_variables];
        let mut row_state = vec![0i8; self.num_constraints];
        let mut basis: Vec<Col<E>> = Vec::new();

        let mut try_add = |this: &Self,
                           active: &mut Vec<ActiveEntry>,
                           basis: &mut Vec<Col<E>>,
                           bound_state: &mut Vec<i8>,
                           row_state: &mut Vec<i8>,
                           x: &mut Col<E>,
                           id: ConstraintId,
                           side: i8| {
            if active.len() >= this.num_variables {
                return;
            }
            let in_set = match id {
                ConstraintId::Bound(i) => bound_state[i] != 0,
                ConstraintId::Row(j) => row_state[j] != 0,
            };
            if in_set {
                return;
            }
            let (lower, upper) = this.constraint_bounds(id);
            let is_equality = lower == upper;
            let target = if side < 0 { lower } else { upper };
            if target.abs() >= SQP_INFINITY {
                return;
            }
            let value = this.constraint_value(id, x);
            let scale = 1. + target.abs();
            if (value - target).abs() > ACTIVITY_TOL * scale {
                return;
            }
            let normal = this.constraint_normal(id);
            if !Self::try_extend_basis(basis, &normal) {
                return;
            }
            match id {
                ConstraintId::Bound(i) => {
                    bound_state[i] = side;
                    // Snap exactly onto the bound.
                    x[i] = target;
                }
                ConstraintId::Row(j) => row_state[j] = side,
            }
            active.push(ActiveEntry {
                id,
                side,
                is_equality,
            });
        };

        // Equality rows and fixed variables first.
        for j in 0..self.num_constraints {
            if self.lower_constraint_bounds[j] == self.upper_constraint_bounds[j] {
                try_add(
                    self,
                    &mut active,
                    &mut basis,
                    &mut bound_state,
                    &mut row_state,
                    &mut x,
                    ConstraintId::Row(j),
                    -1,
                );
            }
        }
        for i in 0..self.num_variables {
            if self.lower_variable_bounds[i] == self.upper_variable_bounds[i] {
                try_add(
                    self,
                    &mut active,
                    &mut basis,
                    &mut bound_state,
                    &mut row_state,
                    &mut x,
                    ConstraintId::Bound(i),
                    -1,
                );
            }
        }

        // Entries requested by the caller, or kept from the previous solve.
        let hinted_bounds = requested_bounds.or_else(|| {
            if self.cold_start || self.status == QpStatus::Uninitialized {
                None
            } else {
                Some(self.bounds_working_set.clone())
            }
        });
        let hinted_rows = requested_rows.or_else(|| {
            if self.cold_start || self.status == QpStatus::Uninitialized {
                None
            } else {
                Some(self.constraints_working_set.clone())
            }
        });
        if let Some(hints) = hinted_bounds {
            for (i, &status) in hints.iter().enumerate() {
                let side = match status {
                    ActivityStatus::ActiveBelow | ActivityStatus::ActiveEquality => -1,
                    ActivityStatus::ActiveAbove => 1,
                    ActivityStatus::Inactive => continue,
                };
                try_add(
                    self,
                    &mut active,
                    &mut basis,
                    &mut bound_state,
                    &mut row_state,
                    &mut x,
                    ConstraintId::Bound(i),
                    side,
                );
            }
        }
        if let Some(hints) = hinted_rows {
            for (j, &status) in hints.iter().enumerate() {
                let side = match status {
                    ActivityStatus::ActiveBelow | ActivityStatus::ActiveEquality => -1,
                    ActivityStatus::ActiveAbove => 1,
                    ActivityStatus::Inactive => continue,
                };
                try_add(
                    self,
                    &mut active,
                    &mut basis,
                    &mut bound_state,
                    &mut row_state,
                    &mut x,
                    ConstraintId::Row(j),
                    side,
                );
            }
        }

        // Fill up with bounds the start already sits on.
        for i in 0..self.num_variables {
            for side in [-1i8, 1] {
                try_add(
                    self,
                    &mut active,
                    &mut basis,
                    &mut bound_state,
                    &mut row_state,
                    &mut x,
                    ConstraintId::Bound(i),
                    side,
                );
            }
        }

        Ok((x, active, bound_state, row_state, basis))
    }

    fn extract_solution(
        &mut self,
        x: &Col<E>,
        active: &[ActiveEntry],
        multipliers: &Col<E>,
        bound_state: &[i8],
        row_state: &[i8],
    ) {
        self.primal = x.clone();
        vector_ops::set_to_zero(&mut self.bound_multipliers);
        vector_ops::set_to_zero(&mut self.constraint_multipliers);
        for (entry, k) in active.iter().zip(0..) {
            match entry.id {
                ConstraintId::Bound(i) => self.bound_multipliers[i] = multipliers[k],
                ConstraintId::Row(j) => self.constraint_multipliers[j] = multipliers[k],
            }
        }

        let bound_lower: Vec<E> = (0..self.num_variables)
            .map(|i| self.lower_variable_bounds[i])
            .collect();
        let bound_upper: Vec<E> = (0..self.num_variables)
            .map(|i| self.upper_variable_bounds[i])
            .collect();
        let row_lower: Vec<E> = (0..self.num_constraints)
            .map(|j| self.lower_constraint_bounds[j])
            .collect();
        let row_upper: Vec<E> = (0..self.num_constraints)
            .map(|j| self.upper_constraint_bounds[j])
            .collect();
        self.bounds_working_set = translate_working_set(bound_state, &bound_lower, &bound_upper);
        self.constraints_working_set = translate_working_set(row_state, &row_lower, &row_upper);

        self.objective = self.objective_value(x);
    }

    fn solve(&mut self) -> QpStatus {
        self.iterations = 0;

        let (mut x, mut active, mut bound_state, mut row_state, mut basis) =
            match self.starting_point() {
                Ok(start) => start,
                Err(status) => return status,
            };

        let hessian_scale = if self.qp_type == QpType::Qp {
            let mut scale: E = 0.;
            for i in 0..self.num_variables {
                scale = scale.max(self.hessian[(i, i)].abs());
            }
            scale.max(1.)
        } else {
            1.
        };

        for _ in 0..self.max_iterations {
            self.iterations += 1;

            let gradient = self.objective_gradient(&x);
            let nullspace = self.nullspace_basis(&basis);
            let dim = nullspace.ncols();

            let gradient_scale = 1. + vector_ops::inf_norm(gradient.as_ref());

            // Reduced direction on the current face, with the step length
            // that minimizes the objective along it (infinite for rays).
            let mut direction: Option<(Col<E>, E)> = None;
            if dim > 0 {
                let reduced_gradient =
                    Col::from_fn(dim, |j| {
                        let mut dot = 0.;
                        for i in 0..self.num_variables {
                            dot += nullspace[(i, j)] * gradient[i];
                        }
                        dot
                    });

                match self.qp_type {
                    QpType::Lp => {
                        if vector_ops::inf_norm(reduced_gradient.as_ref())
                            > STATIONARITY_TOL * gradient_scale
                        {
                            let mut d = Col::zeros(self.num_variables);
                            for i in 0..self.num_variables {
                                for j in 0..dim {
                                    d[i] -= nullspace[(i, j)] * reduced_gradient[j];
                                }
                            }
                            let norm = vector_ops::inf_norm(d.as_ref());
                            vector_ops::scale(&mut d, 1. / norm);
                            direction = Some((d, SQP_INFINITY));
                        }
                    }
                    QpType::Qp => {
                        let mut reduced_hessian = Mat::zeros(dim, dim);
                        for a in 0..dim {
                            let mut hz = Col::zeros(self.num_variables);
                            for i in 0..self.num_variables {
                                let mut dot = 0.;
                                for k in 0..self.num_variables {
                                    dot += self.hessian[(i, k)] * nullspace[(k, a)];
                                }
                                hz[i] = dot;
                            }
                            for b in 0..dim {
                                let mut dot = 0.;
                                for i in 0..self.num_variables {
                                    dot += nullspace[(i, b)] * hz[i];
                                }
                                reduced_hessian[(b, a)] = dot;
                            }
                        }

                        let neg_reduced_gradient = Col::from_fn(dim, |j| -reduced_gradient[j]);
                        let mut delta = self.regularization;
                        let reduced_step = loop {
                            let mut regularized = reduced_hessian.clone();
                            for j in 0..dim {
                                regularized[(j, j)] += delta;
                            }
                            if let Some(y) = solve_llt(regularized.as_ref(), &neg_reduced_gradient)
                            {
                                break Some(y);
                            }
                            delta = if delta <= 0. {
                                1e-8 * hessian_scale
                            } else {
                                delta * 10.
                            };
                            if delta > 1e10 * hessian_scale {
                                break None;
                            }
                        };
                        let Some(y) = reduced_step else {
                            return QpStatus::InternalError;
                        };

                        let mut d = Col::zeros(self.num_variables);
                        for i in 0..self.num_variables {
                            for j in 0..dim {
                                d[i] += nullspace[(i, j)] * y[j];
                            }
                        }
                        if vector_ops::inf_norm(d.as_ref())
                            > STATIONARITY_TOL * (1. + vector_ops::inf_norm(x.as_ref()))
                        {
                            // Exact minimizing step along d.  With an
                            // indefinite Hessian the regularized direction
                            // may have non-positive curvature, in which
                            // case the step is a ray.
                            let slope =
                                vector_ops::inner_product(gradient.as_ref(), d.as_ref());
                            let mut hd = Col::zeros(self.num_variables);
                            for i in 0..self.num_variables {
                                let mut dot = 0.;
                                for k in 0..self.num_variables {
                                    dot += self.hessian[(i, k)] * d[k];
                                }
                                hd[i] = dot;
                            }
                            let curvature =
                                vector_ops::inner_product(d.as_ref(), hd.as_ref());
                            let d_norm_sq =
                                vector_ops::inner_product(d.as_ref(), d.as_ref());
                            if slope < 0. {
                                let step_cap = if curvature > 1e-14 * d_norm_sq {
                                    -slope / curvature
                                } else {
                                    SQP_INFINITY
                                };
                                direction = Some((d, step_cap));
                            }
                        }
                    }
                }
            }

            match direction {
                None => {
                    // Face optimum: test the working-set multipliers.
                    let multipliers = self.working_set_multipliers(&active, &gradient);
                    let mut worst: Option<(I, E)> = None;
                    for (k, entry) in active.iter().enumerate() {
                        if entry.is_equality {
                            continue;
                        }
                        let violation = if entry.side < 0 {
                            -multipliers[k]
                        } else {
                            multipliers[k]
                        };
                        if violation > MULTIPLIER_TOL * gradient_scale
                            && worst.map(|(_, v)| violation > v).unwrap_or(true)
                        {
                            worst = Some((k, violation));
                        }
                    }
                    match worst {
                        None => {
                            self.extract_solution(
                                &x,
                                &active,
                                &multipliers,
                                &bound_state,
                                &row_state,
                            );
                            return QpStatus::Optimal;
                        }
                        Some((k, _)) => {
                            let removed = active.remove(k);
                            match removed.id {
                                ConstraintId::Bound(i) => bound_state[i] = 0,
                                ConstraintId::Row(j) => row_state[j] = 0,
                            }
                            basis.clear();
                            for entry in &active {
                                let normal = self.constraint_normal(entry.id);
                                let added = Self::try_extend_basis(&mut basis, &normal);
                                debug_assert!(added);
                            }
                        }
                    }
                }
                Some((d, step_cap)) => {
                    let (step, blocking) =
                        self.step_length(&x, &d, step_cap, &bound_state, &row_state);
                    if step_cap >= SQP_INFINITY && blocking.is_none() {
                        return QpStatus::Unbounded;
                    }
                    vector_ops::axpy(step, d.as_ref(), &mut x);
                    if let Some((id, side)) = blocking {
                        let normal = self.constraint_normal(id);
                        if Self::try_extend_basis(&mut basis, &normal) {
                            let (lower, upper) = self.constraint_bounds(id);
                            match id {
                                ConstraintId::Bound(i) => {
                                    bound_state[i] = side;
                                    x[i] = if side < 0 { lower } else { upper };
                                }
                                ConstraintId::Row(j) => row_state[j] = side,
                            }
                            active.push(ActiveEntry {
                                id,
                                side,
                                is_equality: lower == upper,
                            });
                        }
                    }
                }
            }
        }

        QpStatus::IterLimit
    }
}

impl QpSolverInterface for DenseActiveSetQp {
    fn num_variables(&self) -> I {
        self.num_variables
    }

    fn num_constraints(&self) -> I {
        self.num_constraints
    }

    fn preferred_orientation(&self) -> StorageOrientation {
        StorageOrientation::RowCompressed
    }

    fn set_lower_variable_bound(&mut self, index: I, value: E) {
        self.lower_variable_bounds[index] = value;
    }

    fn set_upper_variable_bound(&mut self, index: I, value: E) {
        self.upper_variable_bounds[index] = value;
    }

    fn get_lower_variable_bound(&self, index: I) -> E {
        self.lower_variable_bounds[index]
    }

    fn get_upper_variable_bound(&self, index: I) -> E {
        self.upper_variable_bounds[index]
    }

    fn set_lower_constraint_bound(&mut self, index: I, value: E) {
        self.lower_constraint_bounds[index] = value;
    }

    fn set_upper_constraint_bound(&mut self, index: I, value: E) {
        self.upper_constraint_bounds[index] = value;
    }

    fn set_linear_objective_coefficient(&mut self, index: I, value: E) {
        self.gradient[index] = value;
    }

    fn set_objective_hessian(&mut self, hessian: &SparseTripletMatrix) {
        debug_assert_eq!(hessian.num_rows(), self.num_variables);
        debug_assert!(hessian.is_symmetric());
        self.hessian = Mat::zeros(self.num_variables, self.num_variables);
        hessian.for_each_expanded(|row, col, val| {
            self.hessian[(row, col)] += val;
        });
        self.hessian_set = true;
    }

    fn set_constraint_jacobian(&mut self, jacobian: &HarwellBoeingMatrix) {
        debug_assert_eq!(jacobian.num_rows(), self.num_constraints);
        debug_assert_eq!(jacobian.num_cols(), self.num_variables);
        self.jacobian = jacobian.to_dense();
    }

    fn set_initial_working_sets(
        &mut self,
        bounds_working_set: &[ActivityStatus],
        constraints_working_set: &[ActivityStatus],
    ) {
        debug_assert_eq!(bounds_working_set.len(), self.num_variables);
        debug_assert_eq!(constraints_working_set.len(), self.num_constraints);
        self.initial_bounds_working_set = Some(bounds_working_set.to_vec());
        self.initial_constraints_working_set = Some(constraints_working_set.to_vec());
    }

    fn set_initial_primal(&mut self, primal: ColRef<'_, E>) {
        debug_assert_eq!(primal.nrows(), self.num_variables);
        self.initial_primal = Some(primal.to_owned());
    }

    fn optimize(&mut self, stats: &mut Statistics) -> QpStatus {
        if self.qp_type == QpType::Qp && !self.hessian_set {
            self.status = QpStatus::Uninitialized;
            return self.status;
        }
        self.status = self.solve();
        stats.add_qp_iterations(self.iterations);
        self.status
    }

    fn get_solver_status(&self) -> QpStatus {
        self.status
    }

    fn get_primal_solution(&self) -> &Col<E> {
        &self.primal
    }

    fn get_bounds_multipliers(&self) -> &Col<E> {
        &self.bound_multipliers
    }

    fn get_constraint_multipliers(&self) -> &Col<E> {
        &self.constraint_multipliers
    }

    fn get_optimal_objective_value(&self) -> E {
        self.objective
    }

    fn get_bounds_working_set(&self) -> &[ActivityStatus] {
        &self.bounds_working_set
    }

    fn get_constraints_working_set(&self) -> &[ActivityStatus] {
        &self.constraints_working_set
    }

    fn get_num_iterations(&self) -> I {
        self.iterations
    }

    fn calc_kkt_error(&self) -> KktError {
        let mut lagrangian_gradient = self.objective_gradient(&self.primal);
        for i in 0..self.num_variables {
            lagrangian_gradient[i] -= self.bound_multipliers[i];
        }
        for j in 0..self.num_constraints {
            for i in 0..self.num_variables {
                lagrangian_gradient[i] -= self.jacobian[(j, i)] * self.constraint_multipliers[j];
            }
        }
        let body = Col::from_fn(self.num_constraints, |j| {
            self.constraint_value(ConstraintId::Row(j), &self.primal)
        });
        calc_kkt_error(
            self.lower_variable_bounds.as_ref(),
            self.upper_variable_bounds.as_ref(),
            self.lower_constraint_bounds.as_ref(),
            self.upper_constraint_bounds.as_ref(),
            lagrangian_gradient.as_ref(),
            body.as_ref(),
            self.primal.as_ref(),
            self.bound_multipliers.as_ref(),
            self.constraint_multipliers.as_ref(),
            Some((&self.bounds_working_set, &self.constraints_working_set)),
        )
    }

    fn write_qp_data_to_file(&self, path: &Path) -> Result<(), Problem> {
        let dump = crate::qp::dump::QpDump {
            num_variables: self.num_variables,
            num_constraints: self.num_constraints,
            linear_objective: self.gradient.clone(),
            lower_variable_bounds: self.lower_variable_bounds.clone(),
            upper_variable_bounds: self.upper_variable_bounds.clone(),
            lower_constraint_bounds: self.lower_constraint_bounds.clone(),
            upper_constraint_bounds: self.upper_constraint_bounds.clone(),
            hessian: self.hessian.clone(),
            jacobian: self.jacobian.clone(),
        };
        dump.write_to_file(path)
    }
}
