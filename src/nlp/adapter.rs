//! Adapter between the user's [`NlpProblem`] and the iteration engine.
//!
//! The adapter checks sizing and sparsity invariants once per solve,
//! applies the objective scaling factor σ on the way in (`f` and `g` are
//! multiplied by σ, the Hessian callback receives σ), derives the
//! `new_x` / `new_lambda` caching hints by comparing evaluation points, and
//! undoes the scaling exactly once at `finalize_solution`.

use faer::Col;

use crate::linalg::triplet::SparseTripletMatrix;
use crate::linalg::vector_ops;
use crate::nlp::{NlpInfo, NlpProblem};
use crate::qp::working_set::ActivityStatus;
use crate::stats::Statistics;
use crate::{E, SqpError, SqpExitStatus};

/// Scaling and validation wrapper around the user's NLP.
pub struct ScaledNlp<'a> {
    nlp: &'a mut dyn NlpProblem,
    info: NlpInfo,
    objective_scaling_factor: E,
    last_primal: Option<Col<E>>,
    last_multipliers: Option<Col<E>>,
}

impl<'a> ScaledNlp<'a> {
    pub fn new(
        nlp: &'a mut dyn NlpProblem,
        objective_scaling_factor: E,
    ) -> Result<Self, SqpError> {
        let info = nlp.get_nlp_info();
        if info.num_variables == 0 {
            return Err(SqpError::InvalidNlp(
                "problem has no variables".to_string(),
            ));
        }
        if info.num_nonzeros_jacobian > info.num_variables * info.num_constraints {
            return Err(SqpError::InvalidNlp(
                "more Jacobian non-zeros than matrix entries".to_string(),
            ));
        }
        if info.num_nonzeros_hessian > info.num_variables * info.num_variables {
            return Err(SqpError::InvalidNlp(
                "more Hessian non-zeros than matrix entries".to_string(),
            ));
        }
        Ok(Self {
            nlp,
            info,
            objective_scaling_factor,
            last_primal: None,
            last_multipliers: None,
        })
    }

    pub fn info(&self) -> &NlpInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Updates the cached evaluation point and reports whether it changed.
    fn register_primal(&mut self, primal: &Col<E>) -> bool {
        let changed = match &self.last_primal {
            Some(last) => last != primal,
            None => true,
        };
        if changed {
            self.last_primal = Some(primal.clone());
        }
        changed
    }

    fn register_multipliers(&mut self, multipliers: &Col<E>) -> bool {
        let changed = match &self.last_multipliers {
            Some(last) => last != multipliers,
            None => true,
        };
        if changed {
            self.last_multipliers = Some(multipliers.clone());
        }
        changed
    }

    pub fn get_bounds_info(
        &mut self,
        lower_variable_bounds: &mut Col<E>,
        upper_variable_bounds: &mut Col<E>,
        lower_constraint_bounds: &mut Col<E>,
        upper_constraint_bounds: &mut Col<E>,
    ) -> Result<(), SqpError> {
        if !self.nlp.get_bounds_info(
            lower_variable_bounds,
            upper_variable_bounds,
            lower_constraint_bounds,
            upper_constraint_bounds,
        ) {
            return Err(SqpError::InvalidNlp("get_bounds_info failed".to_string()));
        }
        for i in 0..self.info.num_variables {
            if lower_variable_bounds[i] > upper_variable_bounds[i] {
                return Err(SqpError::InvalidNlp(format!(
                    "variable bound {i} has lower > upper"
                )));
            }
        }
        for j in 0..self.info.num_constraints {
            if lower_constraint_bounds[j] > upper_constraint_bounds[j] {
                return Err(SqpError::InvalidNlp(format!(
                    "constraint bound {j} has lower > upper"
                )));
            }
        }
        Ok(())
    }

    pub fn get_starting_point(
        &mut self,
        primal: &mut Col<E>,
        bound_multipliers: Option<&mut Col<E>>,
        constraint_multipliers: Option<&mut Col<E>>,
    ) -> Result<(), SqpError> {
        let mut unused_z = Col::zeros(self.info.num_variables);
        let mut unused_lambda = Col::zeros(self.info.num_constraints);
        let init_duals = bound_multipliers.is_some();
        debug_assert_eq!(init_duals, constraint_multipliers.is_some());
        let z = bound_multipliers.unwrap_or(&mut unused_z);
        let lambda = constraint_multipliers.unwrap_or(&mut unused_lambda);
        if !self
            .nlp
            .get_starting_point(true, primal, init_duals, z, init_duals, lambda)
        {
            return Err(SqpError::InvalidNlp(
                "get_starting_point failed".to_string(),
            ));
        }
        Ok(())
    }

    /// Objective value in the scaled sense; `None` marks an evaluation
    /// failure (the caller treats the point as unacceptable).
    pub fn eval_objective_value(&mut self, primal: &Col<E>) -> Option<E> {
        let new_primal = self.register_primal(primal);
        self.nlp
            .eval_objective_value(primal, new_primal)
            .map(|objective| objective * self.objective_scaling_factor)
    }

    pub fn eval_objective_gradient(&mut self, primal: &Col<E>, gradient: &mut Col<E>) -> bool {
        let new_primal = self.register_primal(primal);
        if !self.nlp.eval_objective_gradient(primal, new_primal, gradient) {
            return false;
        }
        if self.objective_scaling_factor != 1. {
            vector_ops::scale(gradient, self.objective_scaling_factor);
        }
        true
    }

    pub fn eval_constraint_values(
        &mut self,
        primal: &Col<E>,
        constraint_values: &mut Col<E>,
    ) -> bool {
        let new_primal = self.register_primal(primal);
        self.nlp
            .eval_constraint_values(primal, new_primal, constraint_values)
    }

    /// Builds the Jacobian with its declared structure, validating the
    /// non-zero count and index ranges.
    pub fn make_jacobian(&mut self) -> Result<SparseTripletMatrix, SqpError> {
        let (rows, cols) = self.nlp.get_jacobian_structure();
        if rows.len() != self.info.num_nonzeros_jacobian
            || cols.len() != self.info.num_nonzeros_jacobian
        {
            return Err(SqpError::InvalidNlp(
                "Jacobian structure size disagrees with get_nlp_info".to_string(),
            ));
        }
        SparseTripletMatrix::new(
            self.info.num_constraints,
            self.info.num_variables,
            rows,
            cols,
            false,
        )
        .map_err(|_| SqpError::InvalidNlp("invalid Jacobian structure".to_string()))
    }

    /// Builds the Hessian (lower triangle) with its declared structure.
    pub fn make_hessian(&mut self) -> Result<SparseTripletMatrix, SqpError> {
        let (rows, cols) = self.nlp.get_hessian_structure();
        if rows.len() != self.info.num_nonzeros_hessian
            || cols.len() != self.info.num_nonzeros_hessian
        {
            return Err(SqpError::InvalidNlp(
                "Hessian structure size disagrees with get_nlp_info".to_string(),
            ));
        }
        SparseTripletMatrix::new(
            self.info.num_variables,
            self.info.num_variables,
            rows,
            cols,
            true,
        )
        .map_err(|_| SqpError::InvalidNlp("invalid Hessian structure".to_string()))
    }

    pub fn eval_constraint_jacobian(
        &mut self,
        primal: &Col<E>,
        jacobian: &mut SparseTripletMatrix,
    ) -> bool {
        let new_primal = self.register_primal(primal);
        self.nlp
            .eval_constraint_jacobian(primal, new_primal, jacobian.values_mut())
    }

    pub fn eval_lagrangian_hessian(
        &mut self,
        primal: &Col<E>,
        constraint_multipliers: &Col<E>,
        hessian: &mut SparseTripletMatrix,
    ) -> bool {
        let new_primal = self.register_primal(primal);
        let new_multipliers = self.register_multipliers(constraint_multipliers);
        self.nlp.eval_lagrangian_hessian(
            primal,
            new_primal,
            self.objective_scaling_factor,
            constraint_multipliers,
            new_multipliers,
            hessian.values_mut(),
        )
    }

    pub fn use_initial_working_set(&self) -> bool {
        self.nlp.use_initial_working_set()
    }

    pub fn get_initial_working_sets(
        &mut self,
        bounds_working_set: &mut [ActivityStatus],
        constraints_working_set: &mut [ActivityStatus],
    ) -> Result<(), SqpError> {
        if !self
            .nlp
            .get_initial_working_sets(bounds_working_set, constraints_working_set)
        {
            return Err(SqpError::InvalidNlp(
                "warm start requested but no initial working set was provided".to_string(),
            ));
        }
        Ok(())
    }

    /// Reports the final solution to the user with the objective scaling
    /// undone on the objective and on all multipliers.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_solution(
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
        let sigma = self.objective_scaling_factor;
        let mut unscaled_bound_multipliers = bound_multipliers.clone();
        let mut unscaled_constraint_multipliers = constraint_multipliers.clone();
        let mut unscaled_objective = objective_value;
        if sigma != 1. {
            vector_ops::scale(&mut unscaled_bound_multipliers, 1. / sigma);
            vector_ops::scale(&mut unscaled_constraint_multipliers, 1. / sigma);
            unscaled_objective /= sigma;
        }
        self.nlp.finalize_solution(
            status,
            primal,
            &unscaled_bound_multipliers,
            bounds_working_set,
            constraint_values,
            &unscaled_constraint_multipliers,
            constraints_working_set,
            unscaled_objective,
            stats,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::I;

    /// min x1^2 subject to x1 + x2 in [1, 1].
    struct TinyNlp {
        objective_evals_with_new_x: I,
    }

    impl NlpProblem for TinyNlp {
        fn get_nlp_info(&self) -> NlpInfo {
            NlpInfo {
                num_variables: 2,
                num_constraints: 1,
                num_nonzeros_jacobian: 2,
                num_nonzeros_hessian: 1,
                name: "tiny".to_string(),
            }
        }

        fn get_bounds_info(
            &self,
            lower_variable_bounds: &mut Col<E>,
            upper_variable_bounds: &mut Col<E>,
            lower_constraint_bounds: &mut Col<E>,
            upper_constraint_bounds: &mut Col<E>,
        ) -> bool {
            for i in 0..2 {
                lower_variable_bounds[i] = -10.;
                upper_variable_bounds[i] = 10.;
            }
            lower_constraint_bounds[0] = 1.;
            upper_constraint_bounds[0] = 1.;
            true
        }

        fn get_starting_point(
            &self,
            _init_primal: bool,
            primal: &mut Col<E>,
            _init_bound_multipliers: bool,
            _bound_multipliers: &mut Col<E>,
            _init_constraint_multipliers: bool,
            _constraint_multipliers: &mut Col<E>,
        ) -> bool {
            primal[0] = 0.;
            primal[1] = 0.;
            true
        }

        fn eval_objective_value(&mut self, primal: &Col<E>, new_primal: bool) -> Option<E> {
            if new_primal {
                self.objective_evals_with_new_x += 1;
            }
            Some(primal[0] * primal[0])
        }

        fn eval_objective_gradient(
            &mut self,
            primal: &Col<E>,
            _new_primal: bool,
            gradient: &mut Col<E>,
        ) -> bool {
            gradient[0] = 2. * primal[0];
            gradient[1] = 0.;
            true
        }

        fn eval_constraint_values(
            &mut self,
            primal: &Col<E>,
            _new_primal: bool,
            constraint_values: &mut Col<E>,
        ) -> bool {
            constraint_values[0] = primal[0] + primal[1];
            true
        }

        fn get_jacobian_structure(&self) -> (Vec<I>, Vec<I>) {
            (vec![0, 0], vec![0, 1])
        }

        fn eval_constraint_jacobian(
            &mut self,
            _primal: &Col<E>,
            _new_primal: bool,
            values: &mut [E],
        ) -> bool {
            values[0] = 1.;
            values[1] = 1.;
            true
        }

        fn get_hessian_structure(&self) -> (Vec<I>, Vec<I>) {
            (vec![0], vec![0])
        }

        fn eval_lagrangian_hessian(
            &mut self,
            _primal: &Col<E>,
            _new_primal: bool,
            objective_scale: E,
            _constraint_multipliers: &Col<E>,
            _new_multipliers: bool,
            values: &mut [E],
        ) -> bool {
            values[0] = 2. * objective_scale;
            true
        }
    }

    #[test]
    fn test_objective_scaling() {
        let mut nlp = TinyNlp {
            objective_evals_with_new_x: 0,
        };
        let mut adapter = ScaledNlp::new(&mut nlp, 2.).unwrap();
        let x = Col::from_fn(2, |_| 3.);
        assert_eq!(adapter.eval_objective_value(&x), Some(18.));

        let mut gradient = Col::zeros(2);
        assert!(adapter.eval_objective_gradient(&x, &mut gradient));
        assert_eq!(gradient[0], 12.);

        let mut hessian = adapter.make_hessian().unwrap();
        let lambda = Col::zeros(1);
        assert!(adapter.eval_lagrangian_hessian(&x, &lambda, &mut hessian));
        assert_eq!(hessian.values()[0], 4.);
    }

    #[test]
    fn test_new_x_hint_tracks_changes() {
        let mut nlp = TinyNlp {
            objective_evals_with_new_x: 0,
        };
        let mut adapter = ScaledNlp::new(&mut nlp, 1.).unwrap();
        let x = Col::from_fn(2, |_| 1.);
        adapter.eval_objective_value(&x);
        adapter.eval_objective_value(&x);
        let y = Col::from_fn(2, |_| 2.);
        adapter.eval_objective_value(&y);
        assert_eq!(nlp.objective_evals_with_new_x, 2);
    }

    #[test]
    fn test_bounds_validation() {
        struct BadBounds;
        impl NlpProblem for BadBounds {
            fn get_nlp_info(&self) -> NlpInfo {
                NlpInfo {
                    num_variables: 1,
                    num_constraints: 0,
                    num_nonzeros_jacobian: 0,
                    num_nonzeros_hessian: 0,
                    name: "bad".to_string(),
                }
            }
            fn get_bounds_info(
                &self,
                lower_variable_bounds: &mut Col<E>,
                upper_variable_bounds: &mut Col<E>,
                _lower_constraint_bounds: &mut Col<E>,
                _upper_constraint_bounds: &mut Col<E>,
            ) -> bool {
                lower_variable_bounds[0] = 1.;
                upper_variable_bounds[0] = -1.;
                true
            }
            fn get_starting_point(
                &self,
                _init_primal: bool,
                _primal: &mut Col<E>,
                _init_bound_multipliers: bool,
                _bound_multipliers: &mut Col<E>,
                _init_constraint_multipliers: bool,
                _constraint_multipliers: &mut Col<E>,
            ) -> bool {
                true
            }
            fn eval_objective_value(&mut self, _primal: &Col<E>, _new_primal: bool) -> Option<E> {
                Some(0.)
            }
            fn eval_objective_gradient(
                &mut self,
                _primal: &Col<E>,
                _new_primal: bool,
                _gradient: &mut Col<E>,
            ) -> bool {
                true
            }
            fn eval_constraint_values(
                &mut self,
                _primal: &Col<E>,
                _new_primal: bool,
                _constraint_values: &mut Col<E>,
            ) -> bool {
                true
            }
            fn get_jacobian_structure(&self) -> (Vec<I>, Vec<I>) {
                (vec![], vec![])
            }
            fn eval_constraint_jacobian(
                &mut self,
                _primal: &Col<E>,
                _new_primal: bool,
                _values: &mut [E],
            ) -> bool {
                true
            }
            fn get_hessian_structure(&self) -> (Vec<I>, Vec<I>) {
                (vec![], vec![])
            }
            fn eval_lagrangian_hessian(
                &mut self,
                _primal: &Col<E>,
                _new_primal: bool,
                _objective_scale: E,
                _constraint_multipliers: &Col<E>,
                _new_multipliers: bool,
                _values: &mut [E],
            ) -> bool {
                true
            }
        }

        let mut nlp = BadBounds;
        let mut adapter = ScaledNlp::new(&mut nlp, 1.).unwrap();
        let mut x_l = Col::zeros(1);
        let mut x_u = Col::zeros(1);
        let mut c_l = Col::zeros(0);
        let mut c_u = Col::zeros(0);
        assert!(
            adapter
                .get_bounds_info(&mut x_l, &mut x_u, &mut c_l, &mut c_u)
                .is_err()
        );
    }
}
