//! QP subproblem machinery: the abstract back-end contract, the dense
//! active-set back-end, and the handler that owns the SQP subproblems.

pub mod active_set;
pub mod dump;
pub mod handler;
pub mod working_set;

use std::path::Path;

use faer::{Col, ColRef};
use problemo::Problem;

use crate::kkt::KktError;
use crate::linalg::harwell_boeing::{HarwellBoeingMatrix, StorageOrientation};
use crate::linalg::triplet::SparseTripletMatrix;
use crate::stats::Statistics;
use crate::{E, I};
use working_set::ActivityStatus;

/// Whether the subproblem carries a quadratic term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// Linear program (zero Hessian).
    Lp,
    /// Quadratic program.
    Qp,
}

/// Solver status of a QP back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QpStatus {
    #[default]
    /// No problem data has been set yet.
    Uninitialized,
    /// An optimal solution is available.
    Optimal,
    /// The subproblem is unbounded below.
    Unbounded,
    /// The subproblem is infeasible.
    Infeasible,
    /// The internal iteration limit was reached.
    IterLimit,
    /// The back-end encountered an internal error.
    InternalError,
    /// The back-end finished in an undetermined state.
    Unknown,
    /// The back-end failed to run.
    Failed,
    /// Data has been set but no solve was attempted.
    NotSolved,
}

/// Contract between the QP handler and a concrete QP/LP back-end.
///
/// Data is set piecewise; the back-end may hold factorizations across
/// repeated [`QpSolverInterface::optimize`] calls as long as only values
/// (not structure) change.  The first matrix calls fix the structure; later
/// calls must match it.
pub trait QpSolverInterface {
    fn num_variables(&self) -> I;
    fn num_constraints(&self) -> I;

    /// The Harwell–Boeing orientation this back-end consumes.
    fn preferred_orientation(&self) -> StorageOrientation;

    fn set_lower_variable_bound(&mut self, index: I, value: E);
    fn set_upper_variable_bound(&mut self, index: I, value: E);
    fn get_lower_variable_bound(&self, index: I) -> E;
    fn get_upper_variable_bound(&self, index: I) -> E;

    fn set_lower_constraint_bound(&mut self, index: I, value: E);
    fn set_upper_constraint_bound(&mut self, index: I, value: E);

    fn set_linear_objective_coefficient(&mut self, index: I, value: E);

    /// Sets (or overwrites the values of) the objective Hessian, given as
    /// the lower triangle in triplet form.
    fn set_objective_hessian(&mut self, hessian: &SparseTripletMatrix);

    /// Sets (or overwrites the values of) the constraint matrix.
    fn set_constraint_jacobian(&mut self, jacobian: &HarwellBoeingMatrix);

    /// Provides the working set the next solve should start from.
    fn set_initial_working_sets(
        &mut self,
        bounds_working_set: &[ActivityStatus],
        constraints_working_set: &[ActivityStatus],
    );

    /// Provides the primal point the next solve should start from.
    fn set_initial_primal(&mut self, primal: ColRef<'_, E>);

    /// Solves the subproblem, accumulating iteration counts into `stats`.
    fn optimize(&mut self, stats: &mut Statistics) -> QpStatus;

    fn get_solver_status(&self) -> QpStatus;
    fn get_primal_solution(&self) -> &Col<E>;
    fn get_bounds_multipliers(&self) -> &Col<E>;
    fn get_constraint_multipliers(&self) -> &Col<E>;
    fn get_optimal_objective_value(&self) -> E;
    fn get_bounds_working_set(&self) -> &[ActivityStatus];
    fn get_constraints_working_set(&self) -> &[ActivityStatus];
    fn get_num_iterations(&self) -> I;

    /// KKT residuals of the most recent solution.
    fn calc_kkt_error(&self) -> KktError;

    /// Serializes the subproblem data to a file for standalone reproduction.
    fn write_qp_data_to_file(&self, path: &Path) -> Result<(), Problem>;
}
