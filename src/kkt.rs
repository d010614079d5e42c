//! KKT error computation, shared by the NLP and QP optimality tests.
//!
//! The caller supplies the Lagrangian gradient already assembled
//! (`g - z - Jᵀλ` for the NLP, `g + Hx - z - Aᵀλ` for the QP) together with
//! the constraint body evaluated at the point of interest, so the same
//! routine serves both levels.
//!
//! Sign convention throughout the crate: a multiplier on a lower-active
//! bound or constraint is non-negative, on an upper-active one non-positive.

use faer::ColRef;
use serde::Serialize;

use crate::E;
use crate::linalg::vector_ops;
use crate::qp::working_set::ActivityStatus;

/// The four non-negative KKT residuals and their maximum.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KktError {
    pub primal_infeasibility: E,
    pub dual_infeasibility: E,
    pub complementarity_violation: E,
    pub working_set_error: E,
    pub worst_violation: E,
}

/// Computes the KKT residuals at a primal-dual point.
///
/// `working_sets`, when present, is the pair of bound and constraint
/// activity arrays whose faces the primal point is checked against.
#[allow(clippy::too_many_arguments)]
pub fn calc_kkt_error(
    lower_variable_bounds: ColRef<'_, E>,
    upper_variable_bounds: ColRef<'_, E>,
    lower_constraint_bounds: ColRef<'_, E>,
    upper_constraint_bounds: ColRef<'_, E>,
    lagrangian_gradient: ColRef<'_, E>,
    constraint_body: ColRef<'_, E>,
    primal: ColRef<'_, E>,
    bound_multipliers: ColRef<'_, E>,
    constraint_multipliers: ColRef<'_, E>,
    working_sets: Option<(&[ActivityStatus], &[ActivityStatus])>,
) -> KktError {
    let num_variables = primal.nrows();
    let num_constraints = constraint_body.nrows();
    debug_assert_eq!(bound_multipliers.nrows(), num_variables);
    debug_assert_eq!(constraint_multipliers.nrows(), num_constraints);

    let mut primal_infeasibility: E = 0.;
    for i in 0..num_variables {
        primal_infeasibility =
            primal_infeasibility.max(lower_variable_bounds[i] - primal[i]).max(0.);
        primal_infeasibility =
            primal_infeasibility.max(primal[i] - upper_variable_bounds[i]).max(0.);
    }
    for i in 0..num_constraints {
        primal_infeasibility = primal_infeasibility
            .max(lower_constraint_bounds[i] - constraint_body[i])
            .max(0.);
        primal_infeasibility = primal_infeasibility
            .max(constraint_body[i] - upper_constraint_bounds[i])
            .max(0.);
    }

    let dual_infeasibility = vector_ops::inf_norm(lagrangian_gradient);

    // A positive multiplier must pair with zero slack to the lower side, a
    // negative one with zero slack to the upper side.
    let mut complementarity_violation: E = 0.;
    for i in 0..num_variables {
        complementarity_violation = complementarity_violation.max(E::min(
            E::max(0., bound_multipliers[i]),
            primal[i] - lower_variable_bounds[i],
        ));
        complementarity_violation = complementarity_violation.max(E::min(
            E::max(0., -bound_multipliers[i]),
            upper_variable_bounds[i] - primal[i],
        ));
    }
    for i in 0..num_constraints {
        complementarity_violation = complementarity_violation.max(E::min(
            E::max(0., constraint_multipliers[i]),
            constraint_body[i] - lower_constraint_bounds[i],
        ));
        complementarity_violation = complementarity_violation.max(E::min(
            E::max(0., -constraint_multipliers[i]),
            upper_constraint_bounds[i] - constraint_body[i],
        ));
    }

    let mut working_set_error: E = 0.;
    if let Some((bounds_working_set, constraints_working_set)) = working_sets {
        debug_assert_eq!(bounds_working_set.len(), num_variables);
        debug_assert_eq!(constraints_working_set.len(), num_constraints);

        let mut face_distance = |status: ActivityStatus, value: E, lower: E, upper: E| {
            match status {
                ActivityStatus::ActiveAbove => {
                    working_set_error = working_set_error.max((value - upper).abs());
                }
                ActivityStatus::ActiveBelow => {
                    working_set_error = working_set_error.max((value - lower).abs());
                }
                ActivityStatus::ActiveEquality => {
                    working_set_error = working_set_error.max((value - upper).abs());
                    working_set_error = working_set_error.max((value - lower).abs());
                }
                ActivityStatus::Inactive => {}
            }
        };
        for i in 0..num_variables {
            face_distance(
                bounds_working_set[i],
                primal[i],
                lower_variable_bounds[i],
                upper_variable_bounds[i],
            );
        }
        for i in 0..num_constraints {
            face_distance(
                constraints_working_set[i],
                constraint_body[i],
                lower_constraint_bounds[i],
                upper_constraint_bounds[i],
            );
        }
    }

    let worst_violation = primal_infeasibility
        .max(dual_infeasibility)
        .max(complementarity_violation)
        .max(working_set_error);

    KktError {
        primal_infeasibility,
        dual_infeasibility,
        complementarity_violation,
        working_set_error,
        worst_violation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Col;

    fn col(data: &[E]) -> Col<E> {
        Col::from_fn(data.len(), |i| data[i])
    }

    #[test]
    fn test_optimal_point_has_zero_residuals() {
        // min x  s.t. x >= 1  at x = 1, multiplier on the lower bound +1.
        let x = col(&[1.]);
        let x_l = col(&[1.]);
        let x_u = col(&[10.]);
        let c_l = col(&[]);
        let c_u = col(&[]);
        // grad L = g - z = 1 - 1 = 0
        let grad_lagrangian = col(&[0.]);
        let body = col(&[]);
        let z = col(&[1.]);
        let lambda = col(&[]);

        let ws_bounds = [ActivityStatus::ActiveBelow];
        let ws_cons: [ActivityStatus; 0] = [];

        let error = calc_kkt_error(
            x_l.as_ref(),
            x_u.as_ref(),
            c_l.as_ref(),
            c_u.as_ref(),
            grad_lagrangian.as_ref(),
            body.as_ref(),
            x.as_ref(),
            z.as_ref(),
            lambda.as_ref(),
            Some((&ws_bounds, &ws_cons)),
        );
        assert_eq!(error.worst_violation, 0.);
    }

    #[test]
    fn test_violations_are_reported() {
        // x = 0 below its lower bound 1, with a stale positive multiplier on
        // the (inactive) upper bound side.
        let x = col(&[0.]);
        let x_l = col(&[1.]);
        let x_u = col(&[10.]);
        let c_l = col(&[2.]);
        let c_u = col(&[3.]);
        let grad_lagrangian = col(&[0.5]);
        let body = col(&[0.]);
        let z = col(&[-2.]);
        let lambda = col(&[0.]);

        let error = calc_kkt_error(
            x_l.as_ref(),
            x_u.as_ref(),
            c_l.as_ref(),
            c_u.as_ref(),
            grad_lagrangian.as_ref(),
            body.as_ref(),
            x.as_ref(),
            z.as_ref(),
            lambda.as_ref(),
            None,
        );
        assert_eq!(error.primal_infeasibility, 2.);
        assert_eq!(error.dual_infeasibility, 0.5);
        assert_eq!(error.complementarity_violation, 2.);
        assert_eq!(error.working_set_error, 0.);
        assert_eq!(error.worst_violation, 2.);
    }

    #[test]
    fn test_working_set_error() {
        let x = col(&[5.]);
        let x_l = col(&[0.]);
        let x_u = col(&[10.]);
        let c_l = col(&[]);
        let c_u = col(&[]);
        let grad_lagrangian = col(&[0.]);
        let body = col(&[]);
        let z = col(&[0.]);
        let lambda = col(&[]);

        let ws_bounds = [ActivityStatus::ActiveAbove];
        let ws_cons: [ActivityStatus; 0] = [];
        let error = calc_kkt_error(
            x_l.as_ref(),
            x_u.as_ref(),
            c_l.as_ref(),
            c_u.as_ref(),
            grad_lagrangian.as_ref(),
            body.as_ref(),
            x.as_ref(),
            z.as_ref(),
            lambda.as_ref(),
            Some((&ws_bounds, &ws_cons)),
        );
        assert_eq!(error.working_set_error, 5.);
    }
}
