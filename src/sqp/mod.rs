//! The trust-region ℓ₁-penalty SQP iteration engine.
//!
//! Each iteration solves the penalized quadratic subproblem for a trial
//! step, steers the penalty parameter against the best feasibility progress
//! an auxiliary LP can achieve, accepts or rejects the step by a ratio test
//! on the merit function `Φ(x; ρ) = f(x) + ρ θ(x)` (with a watchdog for
//! non-monotone acceptance), updates the trust-region radius, and tests the
//! NLP KKT conditions for termination.
//!
//! [`SqpSolver::optimize`] runs a solve from scratch;
//! [`SqpSolver::reoptimize`] solves again with the same structure, keeping
//! the previous primal-dual iterate, working set, and penalty parameter so
//! the QP back-end can hot-start.

pub mod watchdog;

use std::path::Path;
use std::time::Instant;

use faer::Col;
use problemo::Problem;

use crate::callback::{Callback, FinalSummary, IterationOutput, IterationRecord, NoOpCallback};
use crate::kkt::{KktError, calc_kkt_error};
use crate::linalg::triplet::SparseTripletMatrix;
use crate::linalg::vector_ops;
use crate::nlp::adapter::ScaledNlp;
use crate::nlp::{ConstraintKind, NlpProblem, classify_bounds};
use crate::options::{Options, SqpOptions, StartingMode};
use crate::qp::QpStatus;
use crate::qp::QpType;
use crate::qp::handler::{QpHandler, QpInputs};
use crate::qp::working_set::ActivityStatus;
use crate::stats::Statistics;
use crate::terminators::{
    CpuTimeTerminator, MultipleTerminators, Terminator, TimeOutTerminator, cpu_time_seconds,
};
use crate::{E, I, SQP_INFINITY, SqpError, SqpExitStatus};
use watchdog::{WatchdogBackup, WatchdogStatus};

/// All per-solve state of the engine.  Kept across [`SqpSolver::reoptimize`]
/// calls so iterates, working sets, and factorizations survive.
struct Workspace {
    opts: SqpOptions,

    num_variables: I,
    num_constraints: I,
    num_nonzeros_jacobian: I,
    num_nonzeros_hessian: I,
    num_equality_constraints: I,
    bound_kind: Vec<ConstraintKind>,
    constraint_kind: Vec<ConstraintKind>,

    lower_variable_bounds: Col<E>,
    upper_variable_bounds: Col<E>,
    lower_constraint_bounds: Col<E>,
    upper_constraint_bounds: Col<E>,

    current_iterate: Col<E>,
    current_bound_multipliers: Col<E>,
    current_constraint_multipliers: Col<E>,
    current_objective_value: E,
    current_objective_gradient: Col<E>,
    current_constraint_values: Col<E>,
    current_constraint_jacobian: SparseTripletMatrix,
    current_lagrangian_hessian: SparseTripletMatrix,
    current_infeasibility: E,

    trial_iterate: Col<E>,
    trial_step: Col<E>,
    trial_bound_multipliers: Col<E>,
    trial_constraint_multipliers: Col<E>,
    trial_objective_value: E,
    trial_constraint_values: Col<E>,
    trial_infeasibility: E,
    trial_model_infeasibility: E,
    trial_point_accepted: bool,

    trust_region_radius: E,
    penalty_parameter: E,
    predicted_reduction: E,
    actual_reduction: E,
    eps1: E,
    penalty_tries_this_iteration: I,
    penalty_increased_this_iteration: bool,

    qp_handler: Option<QpHandler>,
    lp_handler: Option<QpHandler>,
    pending_initial_working_sets: Option<(Vec<ActivityStatus>, Vec<ActivityStatus>)>,

    watchdog_status: WatchdogStatus,
    watchdog_sleep_iterations: I,
    watchdog_backup: Option<WatchdogBackup>,

    current_kkt_error: KktError,
    exit_status: SqpExitStatus,
    stats: Statistics,
    info_string: String,

    final_bounds_working_set: Vec<ActivityStatus>,
    final_constraints_working_set: Vec<ActivityStatus>,
    final_bound_multipliers: Col<E>,
    final_constraint_multipliers: Col<E>,
    final_objective_value: E,
}

impl Workspace {
    fn new(opts: SqpOptions, nlp: &mut ScaledNlp<'_>) -> Result<Self, SqpError> {
        let info = nlp.info().clone();
        let num_variables = info.num_variables;
        let num_constraints = info.num_constraints;

        let mut workspace = Self {
            opts,
            num_variables,
            num_constraints,
            num_nonzeros_jacobian: info.num_nonzeros_jacobian,
            num_nonzeros_hessian: info.num_nonzeros_hessian,
            num_equality_constraints: 0,
            bound_kind: vec![ConstraintKind::Unbounded; num_variables],
            constraint_kind: vec![ConstraintKind::Unbounded; num_constraints],
            lower_variable_bounds: Col::zeros(num_variables),
            upper_variable_bounds: Col::zeros(num_variables),
            lower_constraint_bounds: Col::zeros(num_constraints),
            upper_constraint_bounds: Col::zeros(num_constraints),
            current_iterate: Col::zeros(num_variables),
            current_bound_multipliers: Col::zeros(num_variables),
            current_constraint_multipliers: Col::zeros(num_constraints),
            current_objective_value: 0.,
            current_objective_gradient: Col::zeros(num_variables),
            current_constraint_values: Col::zeros(num_constraints),
            current_constraint_jacobian: nlp.make_jacobian()?,
            current_lagrangian_hessian: nlp.make_hessian()?,
            current_infeasibility: 0.,
            trial_iterate: Col::zeros(num_variables),
            trial_step: Col::zeros(num_variables),
            trial_bound_multipliers: Col::zeros(num_variables),
            trial_constraint_multipliers: Col::zeros(num_constraints),
            trial_objective_value: 0.,
            trial_constraint_values: Col::zeros(num_constraints),
            trial_infeasibility: 0.,
            trial_model_infeasibility: 0.,
            trial_point_accepted: false,
            trust_region_radius: 0.,
            penalty_parameter: 0.,
            predicted_reduction: 0.,
            actual_reduction: 0.,
            eps1: 0.,
            penalty_tries_this_iteration: 0,
            penalty_increased_this_iteration: false,
            qp_handler: None,
            lp_handler: None,
            pending_initial_working_sets: None,
            watchdog_status: WatchdogStatus::Inactive,
            watchdog_sleep_iterations: 0,
            watchdog_backup: None,
            current_kkt_error: KktError::default(),
            exit_status: SqpExitStatus::UnknownExitStatus,
            stats: Statistics::new(),
            info_string: String::new(),
            final_bounds_working_set: vec![ActivityStatus::Inactive; num_variables],
            final_constraints_working_set: vec![ActivityStatus::Inactive; num_constraints],
            final_bound_multipliers: Col::zeros(num_variables),
            final_constraint_multipliers: Col::zeros(num_constraints),
            final_objective_value: 0.,
        };

        workspace.read_bounds(nlp)?;
        Ok(workspace)
    }

    fn read_bounds(&mut self, nlp: &mut ScaledNlp<'_>) -> Result<(), SqpError> {
        nlp.get_bounds_info(
            &mut self.lower_variable_bounds,
            &mut self.upper_variable_bounds,
            &mut self.lower_constraint_bounds,
            &mut self.upper_constraint_bounds,
        )?;
        self.classify_constraint_kinds()?;
        Ok(())
    }

    fn classify_constraint_kinds(&mut self) -> Result<(), SqpError> {
        for i in 0..self.num_variables {
            self.bound_kind[i] = classify_bounds(
                self.lower_variable_bounds[i],
                self.upper_variable_bounds[i],
            );
        }
        self.num_equality_constraints = 0;
        for j in 0..self.num_constraints {
            self.constraint_kind[j] = classify_bounds(
                self.lower_constraint_bounds[j],
                self.upper_constraint_bounds[j],
            );
            match self.constraint_kind[j] {
                ConstraintKind::IsEquality => self.num_equality_constraints += 1,
                ConstraintKind::Unbounded => {
                    return Err(SqpError::InvalidNlp(format!(
                        "constraint {j} has no bounds"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reads the starting point according to the starting mode and validates
    /// a user-provided initial working set.
    fn initialize_iterates(
        &mut self,
        nlp: &mut ScaledNlp<'_>,
        force_warm_start: bool,
    ) -> Result<(), SqpError> {
        if self.num_variables < self.num_equality_constraints {
            return Err(SqpError::InvalidNlp(
                "more equality constraints than variables".to_string(),
            ));
        }

        let mode = if force_warm_start {
            StartingMode::WarmStart
        } else {
            self.opts.starting_mode
        };

        match mode {
            StartingMode::PrimalOnly => {
                nlp.get_starting_point(&mut self.current_iterate, None, None)?;
                vector_ops::set_to_zero(&mut self.current_bound_multipliers);
                vector_ops::set_to_zero(&mut self.current_constraint_multipliers);
            }
            StartingMode::PrimalDual | StartingMode::WarmStart => {
                nlp.get_starting_point(
                    &mut self.current_iterate,
                    Some(&mut self.current_bound_multipliers),
                    Some(&mut self.current_constraint_multipliers),
                )?;
            }
        }

        if mode == StartingMode::WarmStart {
            if self.opts.slack_formulation {
                return Err(SqpError::InvalidNlp(
                    "warm starts are not supported with the slack formulation".to_string(),
                ));
            }
            if !nlp.use_initial_working_set() {
                return Err(SqpError::InvalidNlp(
                    "warm start requested but the NLP provides no initial working set".to_string(),
                ));
            }
            let mut bounds_working_set = vec![ActivityStatus::Inactive; self.num_variables];
            let mut constraints_working_set =
                vec![ActivityStatus::Inactive; self.num_constraints];
            nlp.get_initial_working_sets(&mut bounds_working_set, &mut constraints_working_set)?;

            // The number of active entries may not exceed the number of
            // variables.
            let mut num_active = 0;
            for &status in &bounds_working_set {
                if matches!(status, ActivityStatus::ActiveBelow | ActivityStatus::ActiveAbove) {
                    num_active += 1;
                }
            }
            for (j, &status) in constraints_working_set.iter().enumerate() {
                if self.constraint_kind[j] == ConstraintKind::IsEquality {
                    if status != ActivityStatus::Inactive {
                        num_active += 1;
                    }
                } else if matches!(
                    status,
                    ActivityStatus::ActiveBelow | ActivityStatus::ActiveAbove
                ) {
                    num_active += 1;
                }
            }
            if num_active > self.num_variables {
                return Err(SqpError::InvalidInitialWorkingSet);
            }

            self.pending_initial_working_sets =
                Some((bounds_working_set, constraints_working_set));
        }

        self.penalty_parameter = self.opts.penalty_parameter_init_value;
        Ok(())
    }

    /// Creates the QP and LP handlers, or refreshes them after a structure
    /// change.  The derivative matrices are recreated from the (possibly
    /// new) NLP structure.
    fn initialize_qp_handlers(&mut self, nlp: &mut ScaledNlp<'_>) -> Result<(), SqpError> {
        let info = nlp.info().clone();
        self.current_constraint_jacobian = nlp.make_jacobian()?;
        self.current_lagrangian_hessian = nlp.make_hessian()?;

        let structure_changed = info.num_nonzeros_jacobian != self.num_nonzeros_jacobian
            || info.num_nonzeros_hessian != self.num_nonzeros_hessian;
        self.num_nonzeros_jacobian = info.num_nonzeros_jacobian;
        self.num_nonzeros_hessian = info.num_nonzeros_hessian;

        if self.qp_handler.is_none() || structure_changed {
            self.qp_handler = Some(QpHandler::new(
                QpType::Qp,
                self.num_variables,
                self.num_constraints,
                self.opts.slack_formulation,
                nlp.name(),
                &self.opts,
            ));
            self.lp_handler = Some(QpHandler::new(
                QpType::Lp,
                self.num_variables,
                self.num_constraints,
                self.opts.slack_formulation,
                nlp.name(),
                &self.opts,
            ));
        } else {
            // Same structure: keep the handlers (and thereby the back-end's
            // working set) but mark every input dirty.
            self.qp_handler
                .as_mut()
                .unwrap()
                .tracker_mut()
                .trigger_all_updates();
        }

        if let Some((bounds_working_set, constraints_working_set)) =
            self.pending_initial_working_sets.take()
        {
            self.qp_handler
                .as_mut()
                .unwrap()
                .set_initial_working_sets(&bounds_working_set, &constraints_working_set);
        }

        Ok(())
    }

    /// Projects each starting multiplier onto the sign consistent with the
    /// near-active side.
    fn project_multiplier_signs(&mut self) {
        for i in 0..self.num_variables {
            if self.current_iterate[i] > self.lower_variable_bounds[i] {
                self.current_bound_multipliers[i] =
                    self.current_bound_multipliers[i].min(0.);
            }
            if self.current_iterate[i] < self.upper_variable_bounds[i] {
                self.current_bound_multipliers[i] =
                    self.current_bound_multipliers[i].max(0.);
            }
        }
        for j in 0..self.num_constraints {
            if self.current_constraint_values[j] > self.lower_constraint_bounds[j] {
                self.current_constraint_multipliers[j] =
                    self.current_constraint_multipliers[j].min(0.);
            }
            if self.current_constraint_values[j] < self.upper_constraint_bounds[j] {
                self.current_constraint_multipliers[j] =
                    self.current_constraint_multipliers[j].max(0.);
            }
        }
    }

    /// Evaluates functions and derivatives at the starting iterate and
    /// initializes the algorithmic scalars.
    fn compute_initial_values(&mut self, nlp: &mut ScaledNlp<'_>) -> Result<(), SqpError> {
        self.read_bounds(nlp)?;

        // Project the starting point into the bound box; in slack mode the
        // slack variables absorb the violation instead.
        if !self.opts.slack_formulation {
            vector_ops::clip_to_bounds(
                &mut self.current_iterate,
                self.lower_variable_bounds.as_ref(),
                self.upper_variable_bounds.as_ref(),
            );
        }

        self.current_objective_value = nlp
            .eval_objective_value(&self.current_iterate)
            .ok_or_else(|| {
                SqpError::InvalidNlp("objective evaluation failed at the starting point".into())
            })?;
        if !nlp.eval_objective_gradient(&self.current_iterate, &mut self.current_objective_gradient)
        {
            return Err(SqpError::InvalidNlp(
                "gradient evaluation failed at the starting point".into(),
            ));
        }
        if !nlp.eval_constraint_values(&self.current_iterate, &mut self.current_constraint_values)
        {
            return Err(SqpError::InvalidNlp(
                "constraint evaluation failed at the starting point".into(),
            ));
        }
        if !nlp.eval_constraint_jacobian(
            &self.current_iterate,
            &mut self.current_constraint_jacobian,
        ) {
            return Err(SqpError::InvalidNlp(
                "Jacobian evaluation failed at the starting point".into(),
            ));
        }
        if !nlp.eval_lagrangian_hessian(
            &self.current_iterate,
            &self.current_constraint_multipliers,
            &mut self.current_lagrangian_hessian,
        ) {
            return Err(SqpError::InvalidNlp(
                "Hessian evaluation failed at the starting point".into(),
            ));
        }

        self.current_infeasibility = self.compute_constraint_violation(
            &self.current_iterate,
            &self.current_constraint_values,
        );

        self.trust_region_radius = if self.opts.disable_trust_region {
            1e3
        } else {
            self.opts.trust_region_init_size
        };
        self.eps1 = self.opts.eps1;

        if self.opts.watchdog_min_wait_iterations == 0 {
            self.watchdog_status = WatchdogStatus::Inactive;
        } else {
            self.watchdog_status = WatchdogStatus::Ready;
        }
        self.watchdog_sleep_iterations = 0;
        self.watchdog_backup = None;

        self.project_multiplier_signs();
        Ok(())
    }

    /// ℓ₁ violation of the bounds and constraints at a point.
    fn compute_constraint_violation(&self, iterate: &Col<E>, constraint_values: &Col<E>) -> E {
        let mut infeasibility = 0.;
        for j in 0..self.num_constraints {
            infeasibility +=
                (self.lower_constraint_bounds[j] - constraint_values[j]).max(0.);
            infeasibility +=
                (constraint_values[j] - self.upper_constraint_bounds[j]).max(0.);
        }
        for i in 0..self.num_variables {
            infeasibility += (self.lower_variable_bounds[i] - iterate[i]).max(0.);
            infeasibility += (iterate[i] - self.upper_variable_bounds[i]).max(0.);
        }
        infeasibility
    }

    /// Violation of the linearized constraints `c_k + J_k p` along a step.
    fn calc_model_infeasibility(&self, step: &Col<E>) -> E {
        let mut infeasibility = 0.;
        if self.num_constraints > 0 {
            let mut body = self.current_constraint_values.clone();
            self.current_constraint_jacobian.multiply(step.as_ref(), &mut body);
            for j in 0..self.num_constraints {
                infeasibility += (self.lower_constraint_bounds[j] - body[j]).max(0.);
                infeasibility += (body[j] - self.upper_constraint_bounds[j]).max(0.);
            }
        }
        if self.opts.slack_formulation {
            for i in 0..self.num_variables {
                let value = self.current_iterate[i] + step[i];
                infeasibility += (self.lower_variable_bounds[i] - value).max(0.);
                infeasibility += (value - self.upper_variable_bounds[i]).max(0.);
            }
        }
        infeasibility
    }

    /// Buffer added to reductions to absorb round-off near optima.
    fn numerical_error_buffer(&self) -> E {
        1e-10
            * E::max(
                1.,
                E::max(
                    self.current_objective_value.abs(),
                    self.current_infeasibility,
                ),
            )
    }

    /// Solves the QP for a trial step; the QP multipliers become the trial
    /// multipliers.
    fn calculate_search_direction(
        &mut self,
        callback: &mut dyn Callback,
    ) -> Result<(), SqpError> {
        let inputs = QpInputs {
            trust_region_radius: self.trust_region_radius,
            penalty_parameter: self.penalty_parameter,
            lower_variable_bounds: &self.lower_variable_bounds,
            upper_variable_bounds: &self.upper_variable_bounds,
            current_iterate: &self.current_iterate,
            lower_constraint_bounds: &self.lower_constraint_bounds,
            upper_constraint_bounds: &self.upper_constraint_bounds,
            constraint_body: &self.current_constraint_values,
            objective_gradient: &self.current_objective_gradient,
            constraint_jacobian: &self.current_constraint_jacobian,
            lagrangian_hessian: Some(&self.current_lagrangian_hessian),
        };
        let zero_step_objective =
            self.penalty_parameter * self.current_infeasibility + self.numerical_error_buffer();
        let handler = self.qp_handler.as_mut().unwrap();
        handler.setup(&inputs);
        handler.solve(&mut self.stats)?;

        // A correct QP optimum cannot exceed the zero-step objective rho * theta.
        let qp_objective = handler.get_qp_objective();
        if qp_objective > zero_step_objective {
            callback.on_message(&format!(
                "WARNING: QP objective is {qp_objective:e}, which is {:e} too large",
                qp_objective - zero_step_objective
            ));
        }

        self.trial_step = handler.get_primal_step();
        self.trial_bound_multipliers = handler.get_bounds_multipliers();
        self.trial_constraint_multipliers = handler.get_constraint_multipliers();
        self.trial_model_infeasibility = self.calc_model_infeasibility(&self.trial_step);
        Ok(())
    }

    /// Raises the penalty parameter one notch and recomputes the trial step.
    fn increase_penalty_parameter(
        &mut self,
        callback: &mut dyn Callback,
    ) -> Result<(), SqpError> {
        if self.penalty_parameter >= self.opts.penalty_parameter_max_value
            || self.penalty_tries_this_iteration >= self.opts.penalty_iter_max
        {
            return Err(SqpError::PenaltyTooLarge);
        }

        self.penalty_parameter = E::min(
            self.opts.penalty_parameter_max_value,
            self.penalty_parameter * self.opts.penalty_parameter_increase_factor,
        );
        self.penalty_tries_this_iteration += 1;
        self.penalty_increased_this_iteration = true;
        self.stats.try_new_penalty_parameter();

        self.calculate_search_direction(callback)
    }

    /// Predicted reduction of the merit function model along the trial step.
    fn update_predicted_reduction(&mut self) {
        let mut predicted = -vector_ops::inner_product(
            self.current_objective_gradient.as_ref(),
            self.trial_step.as_ref(),
        );

        let mut hessian_step = Col::zeros(self.num_variables);
        self.current_lagrangian_hessian
            .multiply(self.trial_step.as_ref(), &mut hessian_step);
        predicted -=
            0.5 * vector_ops::inner_product(hessian_step.as_ref(), self.trial_step.as_ref());

        predicted += self.penalty_parameter
            * (self.current_infeasibility - self.trial_model_infeasibility);
        self.predicted_reduction = predicted + self.numerical_error_buffer();
    }

    /// Drives the penalty parameter up until the trial step makes enough
    /// feasibility progress (compared to the feasibility LP) and the
    /// predicted merit reduction covers a fraction of it.
    fn update_penalty_parameter(&mut self, callback: &mut dyn Callback) -> Result<(), SqpError> {
        if self.opts.disable_trust_region {
            return Ok(());
        }

        if self.trial_model_infeasibility > self.opts.penalty_update_tol {
            // Determine the best feasibility progress achievable inside the
            // trust region.
            let inputs = QpInputs {
                trust_region_radius: self.trust_region_radius,
                penalty_parameter: 1.,
                lower_variable_bounds: &self.lower_variable_bounds,
                upper_variable_bounds: &self.upper_variable_bounds,
                current_iterate: &self.current_iterate,
                lower_constraint_bounds: &self.lower_constraint_bounds,
                upper_constraint_bounds: &self.upper_constraint_bounds,
                constraint_body: &self.current_constraint_values,
                objective_gradient: &self.current_objective_gradient,
                constraint_jacobian: &self.current_constraint_jacobian,
                lagrangian_hessian: None,
            };
            let lp_handler = self.lp_handler.as_mut().unwrap();
            lp_handler.setup_feasibility_lp(&inputs);
            lp_handler.solve(&mut self.stats)?;
            let lp_step = lp_handler.get_primal_step();
            let lp_model_infeasibility = self.calc_model_infeasibility(&lp_step);

            if lp_model_infeasibility <= self.opts.penalty_update_tol {
                // The LP can drive the linearized violation to zero, so the
                // QP should as well.
                while self.trial_model_infeasibility > self.opts.penalty_update_tol {
                    self.increase_penalty_parameter(callback)?;
                }
            } else {
                let lp_infeasibility_reduction =
                    self.current_infeasibility - lp_model_infeasibility;
                while self.current_infeasibility - self.trial_model_infeasibility
                    < self.eps1 * lp_infeasibility_reduction
                {
                    self.increase_penalty_parameter(callback)?;
                }
            }
        }

        // The predicted reduction must cover a fraction of the predicted
        // infeasibility reduction.
        self.update_predicted_reduction();
        let mut predicted_infeasibility_reduction = self.current_infeasibility
            - self.trial_model_infeasibility
            + self.numerical_error_buffer();
        while self.predicted_reduction
            < self.opts.eps2 * self.penalty_parameter * predicted_infeasibility_reduction
        {
            self.increase_penalty_parameter(callback)?;
            self.update_predicted_reduction();
            predicted_infeasibility_reduction =
                self.current_infeasibility - self.trial_model_infeasibility;
        }
        Ok(())
    }

    /// Evaluates objective and constraints at `x_k + p_k`.  An evaluation
    /// failure makes the trial point unacceptable, not the solve fatal.
    fn calc_trial_point_and_values(&mut self, nlp: &mut ScaledNlp<'_>) {
        vector_ops::set_to_sum_of_vectors(
            &mut self.trial_iterate,
            1.,
            self.current_iterate.as_ref(),
            1.,
            self.trial_step.as_ref(),
        );

        let mut evaluations_failed = false;
        match nlp.eval_objective_value(&self.trial_iterate) {
            Some(objective) => self.trial_objective_value = objective,
            None => evaluations_failed = true,
        }
        if !nlp.eval_constraint_values(&self.trial_iterate, &mut self.trial_constraint_values) {
            evaluations_failed = true;
        }
        if evaluations_failed {
            self.trial_objective_value = SQP_INFINITY;
            self.trial_infeasibility = SQP_INFINITY;
            return;
        }

        self.trial_infeasibility = self
            .compute_constraint_violation(&self.trial_iterate, &self.trial_constraint_values);
    }

    /// Decides acceptance of the trial point from the merit function
    /// reductions.
    fn perform_ratio_test(&mut self) {
        if self.opts.disable_trust_region {
            self.trial_point_accepted = true;
            self.predicted_reduction = 1.;
            self.actual_reduction = 1.;
            self.trial_model_infeasibility = 0.;
            return;
        }

        let mut current_merit = self.current_objective_value
            + self.penalty_parameter * self.current_infeasibility;
        let trial_merit =
            self.trial_objective_value + self.penalty_parameter * self.trial_infeasibility;

        // During a watchdog trial the test is taken against the iterate at
        // which the watchdog was armed.
        if self.watchdog_status == WatchdogStatus::InTrial {
            let backup = self.watchdog_backup.as_ref().unwrap();
            self.predicted_reduction = backup.predicted_reduction;
            current_merit = backup.current_objective_value
                + self.penalty_parameter * backup.current_infeasibility;
        }

        self.actual_reduction =
            current_merit - trial_merit + self.numerical_error_buffer();

        if self.predicted_reduction <= 0. {
            self.exit_status = SqpExitStatus::PredReductionNegative;
            self.trial_point_accepted = false;
            return;
        }

        self.trial_point_accepted = self.actual_reduction
            >= self.opts.trust_region_ratio_accept_tol * self.predicted_reduction;
    }

    fn store_watchdog_backup(&mut self) {
        self.watchdog_backup = Some(WatchdogBackup {
            current_iterate: self.current_iterate.clone(),
            current_bound_multipliers: self.current_bound_multipliers.clone(),
            current_constraint_multipliers: self.current_constraint_multipliers.clone(),
            current_objective_value: self.current_objective_value,
            current_objective_gradient: self.current_objective_gradient.clone(),
            current_constraint_values: self.current_constraint_values.clone(),
            current_constraint_jacobian: self.current_constraint_jacobian.clone(),
            current_lagrangian_hessian: self.current_lagrangian_hessian.clone(),
            current_infeasibility: self.current_infeasibility,
            predicted_reduction: self.predicted_reduction,
            penalty_parameter: self.penalty_parameter,
            trust_region_radius: self.trust_region_radius,
            trial_step: self.trial_step.clone(),
            trial_bound_multipliers: self.trial_bound_multipliers.clone(),
            trial_constraint_multipliers: self.trial_constraint_multipliers.clone(),
            trial_model_infeasibility: self.trial_model_infeasibility,
        });
    }

    fn restore_watchdog_backup(&mut self) {
        let backup = self.watchdog_backup.take().unwrap();
        self.current_iterate = backup.current_iterate;
        self.current_bound_multipliers = backup.current_bound_multipliers;
        self.current_constraint_multipliers = backup.current_constraint_multipliers;
        self.current_objective_value = backup.current_objective_value;
        self.current_objective_gradient = backup.current_objective_gradient;
        self.current_constraint_values = backup.current_constraint_values;
        self.current_constraint_jacobian = backup.current_constraint_jacobian;
        self.current_lagrangian_hessian = backup.current_lagrangian_hessian;
        self.current_infeasibility = backup.current_infeasibility;
        self.predicted_reduction = backup.predicted_reduction;
        self.penalty_parameter = backup.penalty_parameter;
        self.trust_region_radius = backup.trust_region_radius;
        self.trial_step = backup.trial_step;
        self.trial_bound_multipliers = backup.trial_bound_multipliers;
        self.trial_constraint_multipliers = backup.trial_constraint_multipliers;
        self.trial_model_infeasibility = backup.trial_model_infeasibility;

        // The restored iterate no longer matches the back-end's data.
        self.qp_handler
            .as_mut()
            .unwrap()
            .tracker_mut()
            .trigger_all_updates();
    }

    /// Watchdog transitions after the ratio test; see the state machine in
    /// [`watchdog`].
    fn handle_watchdog(&mut self, callback: &mut dyn Callback) {
        if self.watchdog_status != WatchdogStatus::Ready
            && self.watchdog_status != WatchdogStatus::InTrial
        {
            return;
        }

        if !self.trial_point_accepted {
            if self.watchdog_status == WatchdogStatus::Ready {
                callback.on_message("WATCHDOG: activating watchdog");
                self.watchdog_status = WatchdogStatus::InTrial;
                self.info_string.push_str("ws");
                self.store_watchdog_backup();
                // Tentatively accept the rejected step.
                self.trial_point_accepted = true;
            } else {
                callback.on_message("WATCHDOG: trial iterate rejected, restoring backup");
                self.info_string.push_str("wr");
                self.restore_watchdog_backup();
                self.watchdog_status = WatchdogStatus::Sleeping;
                self.watchdog_sleep_iterations = 0;
            }
        } else if self.watchdog_status == WatchdogStatus::InTrial {
            callback.on_message("WATCHDOG: trial iterate accepted");
            self.watchdog_status = WatchdogStatus::Ready;
            self.info_string.push_str("wa");
            self.watchdog_backup = None;
        }
    }

    /// Moves to the trial point and refreshes the derivatives there.
    fn accept_trial_point(&mut self, nlp: &mut ScaledNlp<'_>) -> Result<(), SqpError> {
        debug_assert!(self.trial_point_accepted);

        self.current_infeasibility = self.trial_infeasibility;
        self.current_objective_value = self.trial_objective_value;
        self.current_iterate = self.trial_iterate.clone();
        self.current_constraint_values = self.trial_constraint_values.clone();
        self.current_constraint_multipliers = self.trial_constraint_multipliers.clone();
        self.current_bound_multipliers = self.trial_bound_multipliers.clone();

        if !nlp.eval_objective_gradient(
            &self.current_iterate,
            &mut self.current_objective_gradient,
        ) {
            return Err(SqpError::InvalidNlp(
                "gradient evaluation failed at accepted iterate".into(),
            ));
        }
        if !nlp.eval_constraint_jacobian(
            &self.current_iterate,
            &mut self.current_constraint_jacobian,
        ) {
            return Err(SqpError::InvalidNlp(
                "Jacobian evaluation failed at accepted iterate".into(),
            ));
        }
        if !nlp.eval_lagrangian_hessian(
            &self.current_iterate,
            &self.current_constraint_multipliers,
            &mut self.current_lagrangian_hessian,
        ) {
            return Err(SqpError::InvalidNlp(
                "Hessian evaluation failed at accepted iterate".into(),
            ));
        }

        self.qp_handler
            .as_mut()
            .unwrap()
            .tracker_mut()
            .trigger_all_updates();
        Ok(())
    }

    /// NLP KKT test at the current iterate; sets the exit status when all
    /// residuals are within their tolerances.
    fn check_optimality(&mut self) {
        let mut lagrangian_gradient = self.current_objective_gradient.clone();
        for i in 0..self.num_variables {
            lagrangian_gradient[i] -= self.current_bound_multipliers[i];
        }
        self.current_constraint_jacobian.multiply_transpose(
            self.current_constraint_multipliers.as_ref(),
            &mut lagrangian_gradient,
            -1.,
        );

        self.current_kkt_error = calc_kkt_error(
            self.lower_variable_bounds.as_ref(),
            self.upper_variable_bounds.as_ref(),
            self.lower_constraint_bounds.as_ref(),
            self.upper_constraint_bounds.as_ref(),
            lagrangian_gradient.as_ref(),
            self.current_constraint_values.as_ref(),
            self.current_iterate.as_ref(),
            self.current_bound_multipliers.as_ref(),
            self.current_constraint_multipliers.as_ref(),
            None,
        );

        let error = &self.current_kkt_error;
        if error.primal_infeasibility <= self.opts.opt_tol_primal_feasibility
            && error.dual_infeasibility <= self.opts.opt_tol_dual_feasibility
            && error.complementarity_violation <= self.opts.opt_tol_complementarity
        {
            self.exit_status = SqpExitStatus::Optimal;
        }
    }

    /// Adjusts the trust-region radius from the outcome of the ratio test.
    fn update_trust_region_radius(&mut self) -> Result<(), SqpError> {
        if self.opts.disable_trust_region {
            return Ok(());
        }

        if self.actual_reduction
            < self.opts.trust_region_ratio_decrease_tol * self.predicted_reduction
        {
            let step_size = vector_ops::inf_norm(self.trial_step.as_ref());
            self.trust_region_radius = self.opts.trust_region_decrease_factor
                * E::min(self.trust_region_radius, step_size);
            self.qp_handler
                .as_mut()
                .unwrap()
                .tracker_mut()
                .trigger_trust_region_radius_decrease();
        } else if self.actual_reduction
            > self.opts.trust_region_ratio_increase_tol * self.predicted_reduction
        {
            // Increase only if the step was cut off by the trust region.
            let step_size = vector_ops::inf_norm(self.trial_step.as_ref());
            if (self.trust_region_radius - step_size).abs() < self.opts.opt_tol {
                self.trust_region_radius = E::min(
                    self.opts.trust_region_increase_factor * self.trust_region_radius,
                    self.opts.trust_region_max_value,
                );
                self.qp_handler
                    .as_mut()
                    .unwrap()
                    .tracker_mut()
                    .trigger_bounds_update();
            }
        }

        if self.trust_region_radius < self.opts.trust_region_min_value {
            return Err(SqpError::TrustRegionTooSmall);
        }
        Ok(())
    }

    /// Classification counts of the variable and constraint bounds.
    fn report_problem_statistics(&self, callback: &mut dyn Callback) {
        fn count(kinds: &[ConstraintKind], kind: ConstraintKind) -> I {
            kinds.iter().filter(|&&k| k == kind).count()
        }
        callback.on_message(&format!(
            "Variables: {} (lower bounded {}, upper bounded {}, bounded both {}, fixed {})",
            self.num_variables,
            count(&self.bound_kind, ConstraintKind::BoundedBelow),
            count(&self.bound_kind, ConstraintKind::BoundedAbove),
            count(&self.bound_kind, ConstraintKind::BoundedBelowAndAbove),
            count(&self.bound_kind, ConstraintKind::IsEquality),
        ));
        callback.on_message(&format!(
            "Constraints: {} (equalities {}, inequalities {})",
            self.num_constraints,
            self.num_equality_constraints,
            self.num_constraints - self.num_equality_constraints,
        ));
    }

    fn make_record(&mut self) -> IterationRecord {
        let ratio = if self.predicted_reduction != 0. {
            self.actual_reduction / self.predicted_reduction
        } else {
            0.
        };
        let (qp_kkt_error, num_qp_iterations) = match &self.qp_handler {
            Some(handler) => (handler.get_qp_kkt_error(), handler.get_num_qp_iterations()),
            None => (0., 0),
        };
        IterationRecord {
            iteration: self.stats.num_sqp_iterations,
            objective_value: self.current_objective_value / self.opts.objective_scaling_factor,
            infeasibility: self.current_infeasibility,
            step_norm: vector_ops::inf_norm(self.trial_step.as_ref()),
            trust_region_radius: self.trust_region_radius,
            ratio,
            penalty_parameter: self.penalty_parameter,
            qp_kkt_error,
            num_qp_iterations,
            nlp_kkt_error: self.current_kkt_error.worst_violation,
            info: std::mem::take(&mut self.info_string),
        }
    }

    /// One full SQP iteration; the exit status may be set as a side effect.
    fn iterate(
        &mut self,
        nlp: &mut ScaledNlp<'_>,
        callback: &mut dyn Callback,
    ) -> Result<(), SqpError> {
        self.penalty_tries_this_iteration = 0;
        self.penalty_increased_this_iteration = false;

        // Wake up the watchdog if it has slept long enough.
        self.watchdog_sleep_iterations += 1;
        if self.watchdog_status == WatchdogStatus::Sleeping
            && self.watchdog_sleep_iterations >= self.opts.watchdog_min_wait_iterations
        {
            self.watchdog_status = WatchdogStatus::Ready;
        }

        self.calculate_search_direction(callback)?;

        if self.watchdog_status != WatchdogStatus::InTrial {
            self.update_penalty_parameter(callback)?;
        }

        self.calc_trial_point_and_values(nlp);
        self.perform_ratio_test();
        self.handle_watchdog(callback);

        if self.trial_point_accepted {
            self.accept_trial_point(nlp)?;
            if self.penalty_increased_this_iteration {
                self.stats.penalty_parameter_increase_accepted();
                self.eps1 += (1. - self.eps1) * self.opts.eps1_change_parm;
            }
        }

        self.stats.increase_sqp_iteration_counter();
        if self.exit_status == SqpExitStatus::UnknownExitStatus {
            self.check_optimality();
        }
        let record = self.make_record();
        callback.call(&record);
        Ok(())
    }

    /// Runs the main loop on the already-initialized iterates.
    fn run(
        &mut self,
        nlp: &mut ScaledNlp<'_>,
        callback: &mut dyn Callback,
        terminator: &mut dyn Terminator,
        extra_terminator: Option<&mut (dyn Terminator + '_)>,
    ) -> SqpExitStatus {
        self.exit_status = SqpExitStatus::UnknownExitStatus;
        self.stats = Statistics::new();
        let cpu_time_at_start = cpu_time_seconds();
        let wallclock_start = Instant::now();
        terminator.initialize();
        let mut extra_terminator = extra_terminator;
        if let Some(extra) = extra_terminator.as_deref_mut() {
            extra.initialize();
        }

        let setup = self
            .initialize_qp_handlers(nlp)
            .and_then(|()| self.compute_initial_values(nlp));
        match setup {
            Err(error) => {
                callback.on_message(&error.to_string());
                self.exit_status = error.exit_status();
            }
            Ok(()) => {
                self.report_problem_statistics(callback);
                let initial_record = self.make_record();
                callback.on_solve_start(nlp.info(), &initial_record);

                while self.stats.num_sqp_iterations < self.opts.max_num_iterations
                    && self.exit_status == SqpExitStatus::UnknownExitStatus
                {
                    if let Err(error) = self.iterate(nlp, callback) {
                        callback.on_message(&error.to_string());
                        self.exit_status = error.exit_status();
                        break;
                    }
                    if self.exit_status != SqpExitStatus::UnknownExitStatus {
                        break;
                    }
                    if let Some(status) = terminator.terminate() {
                        self.exit_status = status;
                        break;
                    }
                    if let Some(extra) = extra_terminator.as_deref_mut() {
                        if let Some(status) = extra.terminate() {
                            self.exit_status = status;
                            break;
                        }
                    }
                    if let Err(error) = self.update_trust_region_radius() {
                        callback.on_message(&error.to_string());
                        self.exit_status = error.exit_status();
                        break;
                    }
                }

                if self.exit_status == SqpExitStatus::UnknownExitStatus
                    && self.stats.num_sqp_iterations >= self.opts.max_num_iterations
                {
                    self.exit_status = SqpExitStatus::ExceedMaxIterations;
                }
            }
        }

        self.stats.set_final_penalty_parameter(
            self.penalty_parameter / self.opts.objective_scaling_factor,
        );
        self.return_results(nlp);

        let summary = FinalSummary {
            status: self.exit_status,
            num_variables: self.num_variables,
            num_equality_constraints: self.num_equality_constraints,
            num_inequality_constraints: self.num_constraints - self.num_equality_constraints,
            num_sqp_iterations: self.stats.num_sqp_iterations,
            num_qp_iterations: self.stats.num_qp_iterations,
            objective_value: self.final_objective_value,
            kkt_error: self.current_kkt_error,
            infeasibility: self.current_infeasibility,
            cpu_seconds: cpu_time_seconds() - cpu_time_at_start,
            wallclock_seconds: wallclock_start.elapsed().as_secs_f64(),
        };
        callback.on_finish(&summary);

        self.exit_status
    }

    /// Records the final working set and hands the (unscaled) solution to
    /// the NLP.
    fn return_results(&mut self, nlp: &mut ScaledNlp<'_>) {
        if let Some(handler) = &self.qp_handler {
            if handler.get_solver_status() == QpStatus::Optimal {
                self.final_bounds_working_set = handler.get_bounds_working_set();
                self.final_constraints_working_set = handler.get_constraints_working_set();
            }
        }

        let sigma = self.opts.objective_scaling_factor;
        self.final_bound_multipliers = self.current_bound_multipliers.clone();
        self.final_constraint_multipliers = self.current_constraint_multipliers.clone();
        if sigma != 1. {
            vector_ops::scale(&mut self.final_bound_multipliers, 1. / sigma);
            vector_ops::scale(&mut self.final_constraint_multipliers, 1. / sigma);
        }
        self.final_objective_value = self.current_objective_value / sigma;

        nlp.finalize_solution(
            self.exit_status,
            &self.current_iterate,
            &self.current_bound_multipliers,
            &self.final_bounds_working_set,
            &self.current_constraint_values,
            &self.current_constraint_multipliers,
            &self.final_constraints_working_set,
            self.current_objective_value,
            &self.stats,
        );
    }
}

/// Trust-region ℓ₁-penalty SQP solver with active-set warm starts.
pub struct SqpSolver {
    options: Options,
    force_warm_start: bool,
    workspace: Option<Workspace>,
    callback: Option<Box<dyn Callback>>,
    terminator: Option<Box<dyn Terminator>>,
}

impl Default for SqpSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqpSolver {
    pub fn new() -> Self {
        Self {
            options: Options::new(),
            force_warm_start: false,
            workspace: None,
            callback: None,
            terminator: None,
        }
    }

    /// The option registry, for programmatic option setting.
    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Replaces the iteration callback (default: console output governed by
    /// `print_level`).
    pub fn set_callback(&mut self, callback: Box<dyn Callback>) {
        self.callback = Some(callback);
    }

    /// Adds a user terminator polled at every iteration boundary.
    pub fn set_terminator(&mut self, terminator: Box<dyn Terminator>) {
        self.terminator = Some(terminator);
    }

    /// Forces the next `optimize` call to start in warm-start mode,
    /// irrespective of the `starting_mode` option.  Consumed by that call.
    pub fn force_warm_start(&mut self) {
        self.force_warm_start = true;
    }

    /// Full solve from scratch.  Options are optionally read from a file
    /// first; the NLP is sized, classified, and iterated to a final status.
    pub fn optimize(
        &mut self,
        nlp: &mut dyn NlpProblem,
        options_file: Option<&Path>,
    ) -> Result<SqpExitStatus, Problem> {
        if let Some(path) = options_file {
            self.options.read_from_file(path)?;
        }
        let opts = SqpOptions::from_options(&self.options)?;

        let mut adapter = match ScaledNlp::new(nlp, opts.objective_scaling_factor) {
            Ok(adapter) => adapter,
            Err(error) => return Ok(error.exit_status()),
        };

        let force_warm_start = self.force_warm_start;
        self.force_warm_start = false;

        let mut workspace = match Workspace::new(opts, &mut adapter) {
            Ok(workspace) => workspace,
            Err(error) => return Ok(error.exit_status()),
        };
        if let Err(error) = workspace.initialize_iterates(&mut adapter, force_warm_start) {
            workspace.exit_status = error.exit_status();
            self.workspace = Some(workspace);
            return Ok(error.exit_status());
        }

        self.workspace = Some(workspace);
        Ok(self.run_current(&mut adapter))
    }

    /// Solves again with the same problem dimensions but possibly changed
    /// bounds or data.  The previous iterate, multipliers, penalty
    /// parameter, and working set are retained.
    pub fn reoptimize(&mut self, nlp: &mut dyn NlpProblem) -> Result<SqpExitStatus, Problem> {
        let opts = SqpOptions::from_options(&self.options)?;
        if self.workspace.is_none() {
            return Err(SqpError::InvalidNlp(
                "reoptimize called before a successful optimize".to_string(),
            ))?;
        }

        let mut adapter = match ScaledNlp::new(nlp, opts.objective_scaling_factor) {
            Ok(adapter) => adapter,
            Err(error) => return Ok(error.exit_status()),
        };

        {
            let workspace = self.workspace.as_mut().unwrap();
            let info = adapter.info();
            if info.num_variables != workspace.num_variables
                || info.num_constraints != workspace.num_constraints
            {
                return Err(SqpError::InvalidNlp(
                    "problem dimensions changed between restart calls".to_string(),
                ))?;
            }
            workspace.opts = opts;
        }

        Ok(self.run_current(&mut adapter))
    }

    fn run_current(&mut self, adapter: &mut ScaledNlp<'_>) -> SqpExitStatus {
        let workspace = self.workspace.as_mut().unwrap();

        let mut default_callback: Box<dyn Callback> = if workspace.opts.print_level > 0 {
            Box::new(IterationOutput::new())
        } else {
            Box::new(NoOpCallback {})
        };
        let callback: &mut dyn Callback = match self.callback.as_deref_mut() {
            Some(callback) => callback,
            None => default_callback.as_mut(),
        };

        let mut time_limits = MultipleTerminators::new(vec![
            Box::new(TimeOutTerminator::new(workspace.opts.wallclock_time_limit)),
            Box::new(CpuTimeTerminator::new(workspace.opts.cpu_time_limit)),
        ]);

        workspace.run(
            adapter,
            callback,
            &mut time_limits,
            self.terminator.as_deref_mut(),
        )
    }

    /// Exit status of the most recent solve.
    pub fn exit_status(&self) -> SqpExitStatus {
        self.workspace
            .as_ref()
            .map(|workspace| workspace.exit_status)
            .unwrap_or(SqpExitStatus::UnknownExitStatus)
    }

    /// Final primal iterate of the most recent solve.
    pub fn primal_solution(&self) -> Option<&Col<E>> {
        self.workspace
            .as_ref()
            .map(|workspace| &workspace.current_iterate)
    }

    /// Final constraint values of the most recent solve.
    pub fn constraint_values(&self) -> Option<&Col<E>> {
        self.workspace
            .as_ref()
            .map(|workspace| &workspace.current_constraint_values)
    }

    /// Final bound multipliers, in the user's (unscaled) sense.
    pub fn bound_multipliers(&self) -> Option<&Col<E>> {
        self.workspace
            .as_ref()
            .map(|workspace| &workspace.final_bound_multipliers)
    }

    /// Final constraint multipliers, in the user's (unscaled) sense.
    pub fn constraint_multipliers(&self) -> Option<&Col<E>> {
        self.workspace
            .as_ref()
            .map(|workspace| &workspace.final_constraint_multipliers)
    }

    /// Objective value at the final iterate, in the user's sense.
    pub fn objective_value(&self) -> Option<E> {
        self.workspace
            .as_ref()
            .map(|workspace| workspace.final_objective_value)
    }

    /// Working set of the bounds at the final iterate.
    pub fn bounds_working_set(&self) -> Option<&[ActivityStatus]> {
        self.workspace
            .as_ref()
            .map(|workspace| workspace.final_bounds_working_set.as_slice())
    }

    /// Working set of the constraints at the final iterate.
    pub fn constraints_working_set(&self) -> Option<&[ActivityStatus]> {
        self.workspace
            .as_ref()
            .map(|workspace| workspace.final_constraints_working_set.as_slice())
    }

    /// KKT residuals at the final iterate.
    pub fn kkt_error(&self) -> Option<&KktError> {
        self.workspace
            .as_ref()
            .map(|workspace| &workspace.current_kkt_error)
    }

    /// Statistics of the most recent solve.
    pub fn statistics(&self) -> Option<&Statistics> {
        self.workspace.as_ref().map(|workspace| &workspace.stats)
    }
}
