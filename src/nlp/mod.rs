//! User-facing interface of a nonlinear program.
//!
//! A problem of the form
//!
//! ```text
//!   min  f(x)
//!   s.t. c_L <= c(x) <= c_U
//!        x_L <=  x   <= x_U
//! ```
//!
//! is described by implementing [`NlpProblem`].  Derivative structures are
//! communicated once (structure-then-values convention, zero-based triplet
//! indices); evaluation callbacks receive `new_x` / `new_lambda` hints so
//! implementations may cache intermediate results.

pub mod adapter;

use faer::Col;

use crate::qp::working_set::ActivityStatus;
use crate::stats::Statistics;
use crate::{E, I, SQP_INFINITY, SqpExitStatus};

/// Fixed problem dimensions, queried once per solve.
#[derive(Debug, Clone)]
pub struct NlpInfo {
    pub num_variables: I,
    pub num_constraints: I,
    pub num_nonzeros_jacobian: I,
    pub num_nonzeros_hessian: I,
    pub name: String,
}

/// How a variable or constraint is bounded.  Equality requires the two
/// bounds to be bitwise equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unbounded,
    BoundedBelow,
    BoundedAbove,
    BoundedBelowAndAbove,
    IsEquality,
}

/// Classifies a bound pair.  Requires `lower <= upper`.
pub fn classify_bounds(lower: E, upper: E) -> ConstraintKind {
    debug_assert!(lower <= upper);
    if lower > -SQP_INFINITY && upper < SQP_INFINITY {
        if lower == upper {
            ConstraintKind::IsEquality
        } else {
            ConstraintKind::BoundedBelowAndAbove
        }
    } else if lower > -SQP_INFINITY {
        ConstraintKind::BoundedBelow
    } else if upper < SQP_INFINITY {
        ConstraintKind::BoundedAbove
    } else {
        ConstraintKind::Unbounded
    }
}

/// Callback interface the SQP solver drives.
///
/// Evaluation methods return `false` (or `None`) to signal an evaluation
/// failure; at a trial point this makes the step unacceptable, elsewhere it
/// aborts the solve.
pub trait NlpProblem {
    /// Problem dimensions; fixed for the lifetime of a solve.
    fn get_nlp_info(&self) -> NlpInfo;

    /// Fills in the variable and constraint bounds.
    fn get_bounds_info(
        &self,
        lower_variable_bounds: &mut Col<E>,
        upper_variable_bounds: &mut Col<E>,
        lower_constraint_bounds: &mut Col<E>,
        upper_constraint_bounds: &mut Col<E>,
    ) -> bool;

    /// Fills in the requested parts of the starting point.  The flags tell
    /// the callback which arrays to fill.
    fn get_starting_point(
        &self,
        init_primal: bool,
        primal: &mut Col<E>,
        init_bound_multipliers: bool,
        bound_multipliers: &mut Col<E>,
        init_constraint_multipliers: bool,
        constraint_multipliers: &mut Col<E>,
    ) -> bool;

    fn eval_objective_value(&mut self, primal: &Col<E>, new_primal: bool) -> Option<E>;

    fn eval_objective_gradient(
        &mut self,
        primal: &Col<E>,
        new_primal: bool,
        gradient: &mut Col<E>,
    ) -> bool;

    fn eval_constraint_values(
        &mut self,
        primal: &Col<E>,
        new_primal: bool,
        constraint_values: &mut Col<E>,
    ) -> bool;

    /// Structural non-zeros of the constraint Jacobian, zero-based.
    fn get_jacobian_structure(&self) -> (Vec<I>, Vec<I>);

    fn eval_constraint_jacobian(
        &mut self,
        primal: &Col<E>,
        new_primal: bool,
        values: &mut [E],
    ) -> bool;

    /// Structural non-zeros of the lower triangle of the Lagrangian
    /// Hessian, zero-based.
    fn get_hessian_structure(&self) -> (Vec<I>, Vec<I>);

    /// Evaluates the Hessian of `objective_scale * f - λᵀ c`.
    #[allow(clippy::too_many_arguments)]
    fn eval_lagrangian_hessian(
        &mut self,
        primal: &Col<E>,
        new_primal: bool,
        objective_scale: E,
        constraint_multipliers: &Col<E>,
        new_multipliers: bool,
        values: &mut [E],
    ) -> bool;

    /// Whether an initial working set is available for a warm start.
    fn use_initial_working_set(&self) -> bool {
        false
    }

    /// Fills in the initial working set when
    /// [`NlpProblem::use_initial_working_set`] reports true.
    fn get_initial_working_sets(
        &self,
        bounds_working_set: &mut [ActivityStatus],
        constraints_working_set: &mut [ActivityStatus],
    ) -> bool {
        let _ = (bounds_working_set, constraints_working_set);
        false
    }

    /// Receives the final solution, in the user's (unscaled) sense.
    #[allow(clippy::too_many_arguments)]
    fn finalize_solution(
        &mut self,
        status: SqpExitStatus,
        primal: &Col<E>,
        bound_multipliers: &Col<E>,
        bounds_working_set: &[ActivityStatus],
        constraint_values: &Col<E>,
        constraint_multipliers: &Col<E>,
        constraints_working_set: &[ActivityStatus],
        objective_value: E,
        stats: &Statistics,
    ) {
        let _ = (
            status,
            primal,
            bound_multipliers,
            bounds_working_set,
            constraint_values,
            constraint_multipliers,
            constraints_working_set,
            objective_value,
            stats,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bounds() {
        assert_eq!(
            classify_bounds(-SQP_INFINITY, SQP_INFINITY),
            ConstraintKind::Unbounded
        );
        assert_eq!(
            classify_bounds(0., SQP_INFINITY),
            ConstraintKind::BoundedBelow
        );
        assert_eq!(
            classify_bounds(-SQP_INFINITY, 1.),
            ConstraintKind::BoundedAbove
        );
        assert_eq!(classify_bounds(0., 1.), ConstraintKind::BoundedBelowAndAbove);
        assert_eq!(classify_bounds(1., 1.), ConstraintKind::IsEquality);
    }
}
