//! Failure modes, boundary behaviors, and reproduction round trips.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use faer::Col;

use crate::callback::{Callback, IterationRecord};
use crate::linalg::harwell_boeing::{HarwellBoeingMatrix, StorageOrientation};
use crate::linalg::triplet::SparseTripletMatrix;
use crate::nlp::{NlpInfo, NlpProblem};
use crate::qp::active_set::DenseActiveSetQp;
use crate::qp::dump::QpDump;
use crate::qp::working_set::ActivityStatus;
use crate::qp::{QpSolverInterface, QpStatus, QpType};
use crate::sqp::SqpSolver;
use crate::stats::Statistics;
use crate::terminators::TimeOutTerminator;
use crate::tests::hs071::{Hs071, quiet_solver};
use crate::{E, I, SQP_INFINITY, SqpExitStatus};

/// An NLP whose objective pull is stronger than any admissible penalty:
/// `min -1e13 x + x^2/2  s.t.  x = 0`.  The penalty parameter has to chase
/// the objective gradient and hits its ceiling.
struct PenaltyBuster;

impl NlpProblem for PenaltyBuster {
    fn get_nlp_info(&self) -> NlpInfo {
        NlpInfo {
            num_variables: 1,
            num_constraints: 1,
            num_nonzeros_jacobian: 1,
            num_nonzeros_hessian: 1,
            name: "penalty_buster".to_string(),
        }
    }

    fn get_bounds_info(
        &self,
        lower_variable_bounds: &mut Col<E>,
        upper_variable_bounds: &mut Col<E>,
        lower_constraint_bounds: &mut Col<E>,
        upper_constraint_bounds: &mut Col<E>,
    ) -> bool {
        lower_variable_bounds[0] = -10.;
        upper_variable_bounds[0] = 10.;
        lower_constraint_bounds[0] = 0.;
        upper_constraint_bounds[0] = 0.;
        true
    }

    fn get_starting_point(
        &self,
        init_primal: bool,
        primal: &mut Col<E>,
        _init_bound_multipliers: bool,
        _bound_multipliers: &mut Col<E>,
        _init_constraint_multipliers: bool,
        _constraint_multipliers: &mut Col<E>,
    ) -> bool {
        if init_primal {
            primal[0] = 0.;
        }
        true
    }

    fn eval_objective_value(&mut self, primal: &Col<E>, _new_primal: bool) -> Option<E> {
        Some(-1e13 * primal[0] + 0.5 * primal[0] * primal[0])
    }

    fn eval_objective_gradient(
        &mut self,
        primal: &Col<E>,
        _new_primal: bool,
        gradient: &mut Col<E>,
    ) -> bool {
        gradient[0] = -1e13 + primal[0];
        true
    }

    fn eval_constraint_values(
        &mut self,
        primal: &Col<E>,
        _new_primal: bool,
        constraint_values: &mut Col<E>,
    ) -> bool {
        constraint_values[0] = primal[0];
        true
    }

    fn get_jacobian_structure(&self) -> (Vec<I>, Vec<I>) {
        (vec![0], vec![0])
    }

    fn eval_constraint_jacobian(
        &mut self,
        _primal: &Col<E>,
        _new_primal: bool,
        values: &mut [E],
    ) -> bool {
        values[0] = 1.;
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
        values[0] = objective_scale;
        true
    }
}

#[test]
fn test_penalty_ceiling() {
    let mut nlp = PenaltyBuster;
    let mut solver = quiet_solver();
    let status = solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(status, SqpExitStatus::PenaltyTooLarge);
}

/// An unconstrained NLP whose reported gradient points the wrong way, so no
/// trial step ever passes the ratio test and the trust region collapses.
struct LyingGradient;

impl NlpProblem for LyingGradient {
    fn get_nlp_info(&self) -> NlpInfo {
        NlpInfo {
            num_variables: 1,
            num_constraints: 0,
            num_nonzeros_jacobian: 0,
            num_nonzeros_hessian: 0,
            name: "lying_gradient".to_string(),
        }
    }

    fn get_bounds_info(
        &self,
        lower_variable_bounds: &mut Col<E>,
        upper_variable_bounds: &mut Col<E>,
        _lower_constraint_bounds: &mut Col<E>,
        _upper_constraint_bounds: &mut Col<E>,
    ) -> bool {
        lower_variable_bounds[0] = -100.;
        upper_variable_bounds[0] = 100.;
        true
    }

    fn get_starting_point(
        &self,
        init_primal: bool,
        primal: &mut Col<E>,
        _init_bound_multipliers: bool,
        _bound_multipliers: &mut Col<E>,
        _init_constraint_multipliers: bool,
        _constraint_multipliers: &mut Col<E>,
    ) -> bool {
        if init_primal {
            primal[0] = 0.;
        }
        true
    }

    fn eval_objective_value(&mut self, primal: &Col<E>, _new_primal: bool) -> Option<E> {
        Some(primal[0])
    }

    fn eval_objective_gradient(
        &mut self,
        _primal: &Col<E>,
        _new_primal: bool,
        gradient: &mut Col<E>,
    ) -> bool {
        // Deliberately inconsistent with the objective.
        gradient[0] = -1.;
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

#[test]
fn test_trust_region_collapse_without_watchdog() {
    let mut nlp = LyingGradient;
    let mut solver = quiet_solver();
    solver
        .options_mut()
        .set_option("watchdog_min_wait_iterations", 0 as I)
        .unwrap();
    let status = solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(status, SqpExitStatus::TrustRegionTooSmall);
}

#[test]
fn test_trust_region_collapse_with_watchdog() {
    let mut nlp = LyingGradient;
    let mut solver = quiet_solver();
    let status = solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(status, SqpExitStatus::TrustRegionTooSmall);
}

/// A working set marking more entries active than there are variables is
/// rejected before any QP is solved.
#[test]
fn test_overfull_initial_working_set_rejected() {
    let mut nlp = Hs071 {
        initial_working_sets: Some((
            vec![ActivityStatus::ActiveBelow; 4],
            vec![ActivityStatus::ActiveBelow, ActivityStatus::ActiveEquality],
        )),
        ..Default::default()
    };
    let mut solver = quiet_solver();
    solver
        .options_mut()
        .set_from_string("starting_mode", "warm-start")
        .unwrap();
    let status = solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(status, SqpExitStatus::InvalidInitialWorkingSet);
    assert_eq!(solver.statistics().unwrap().num_qp_iterations, 0);
}

/// Convex QP posed as an NLP: `min (x1-1)^2 + (x2-2.5)^2  s.t.  x1+x2 <= 2`.
struct ConvexQp;

impl NlpProblem for ConvexQp {
    fn get_nlp_info(&self) -> NlpInfo {
        NlpInfo {
            num_variables: 2,
            num_constraints: 1,
            num_nonzeros_jacobian: 2,
            num_nonzeros_hessian: 2,
            name: "convex_qp".to_string(),
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
            lower_variable_bounds[i] = -5.;
            upper_variable_bounds[i] = 5.;
        }
        lower_constraint_bounds[0] = -SQP_INFINITY;
        upper_constraint_bounds[0] = 2.;
        true
    }

    fn get_starting_point(
        &self,
        init_primal: bool,
        primal: &mut Col<E>,
        init_bound_multipliers: bool,
        bound_multipliers: &mut Col<E>,
        init_constraint_multipliers: bool,
        constraint_multipliers: &mut Col<E>,
    ) -> bool {
        if init_primal {
            primal[0] = 0.;
            primal[1] = 0.;
        }
        if init_bound_multipliers {
            bound_multipliers[0] = 0.;
            bound_multipliers[1] = 0.;
        }
        if init_constraint_multipliers {
            constraint_multipliers[0] = 0.;
        }
        true
    }

    fn eval_objective_value(&mut self, primal: &Col<E>, _new_primal: bool) -> Option<E> {
        let dx = primal[0] - 1.;
        let dy = primal[1] - 2.5;
        Some(dx * dx + dy * dy)
    }

    fn eval_objective_gradient(
        &mut self,
        primal: &Col<E>,
        _new_primal: bool,
        gradient: &mut Col<E>,
    ) -> bool {
        gradient[0] = 2. * (primal[0] - 1.);
        gradient[1] = 2. * (primal[1] - 2.5);
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
        (vec![0, 1], vec![0, 1])
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
        values[1] = 2. * objective_scale;
        true
    }
}

/// A strictly interior start with zero multipliers must solve a convex QP
/// to optimality.
#[test]
fn test_convex_qp_from_interior_start() {
    let mut nlp = ConvexQp;
    let mut solver = quiet_solver();
    let status = solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(status, SqpExitStatus::Optimal);

    let x = solver.primal_solution().unwrap();
    assert!((x[0] - 0.25).abs() < 1e-6);
    assert!((x[1] - 1.75).abs() < 1e-6);
    assert_eq!(
        solver.constraints_working_set().unwrap()[0],
        ActivityStatus::ActiveAbove
    );
    // Upper-active constraint carries a non-positive multiplier.
    assert!(solver.constraint_multipliers().unwrap()[0] < 0.);
}

/// With the trust region disabled every step is accepted and the collapse
/// exit can never trigger.
#[test]
fn test_disabled_trust_region_accepts_everything() {
    let mut nlp = ConvexQp;
    let mut solver = quiet_solver();
    solver
        .options_mut()
        .set_option("disable_trust_region", true)
        .unwrap();
    let status = solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(status, SqpExitStatus::Optimal);
    let x = solver.primal_solution().unwrap();
    assert!((x[0] - 0.25).abs() < 1e-6);
    assert!((x[1] - 1.75).abs() < 1e-6);
}

struct CountingCallback {
    calls: Arc<AtomicUsize>,
}

impl Callback for CountingCallback {
    fn call(&mut self, _record: &IterationRecord) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_callback_called_once_per_iteration() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut nlp = ConvexQp;
    let mut solver = quiet_solver();
    solver.set_callback(Box::new(CountingCallback {
        calls: calls.clone(),
    }));
    solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(
        calls.load(Ordering::SeqCst),
        solver.statistics().unwrap().num_sqp_iterations
    );
}

#[test]
fn test_user_terminator_stops_the_loop() {
    let mut nlp = Hs071::default();
    let mut solver = quiet_solver();
    solver
        .options_mut()
        .set_from_string("starting_mode", "primal")
        .unwrap();
    solver.set_terminator(Box::new(TimeOutTerminator::new(0.)));
    let status = solver.optimize(&mut nlp, None).unwrap();
    assert_eq!(status, SqpExitStatus::ExceedMaxWallclockTime);
    assert_eq!(solver.statistics().unwrap().num_sqp_iterations, 1);
}

#[test]
fn test_options_file_is_applied() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# solver configuration").unwrap();
    writeln!(file, "max_num_iterations 1").unwrap();
    writeln!(file, "starting_mode primal").unwrap();
    writeln!(file, "print_level 0").unwrap();
    file.flush().unwrap();

    let mut nlp = Hs071::default();
    let mut solver = SqpSolver::new();
    let status = solver.optimize(&mut nlp, Some(file.path())).unwrap();
    assert_eq!(status, SqpExitStatus::ExceedMaxIterations);
}

/// Shipping a dumped QP to a standalone back-end reproduces the original
/// primal/dual solution and working set.
#[test]
fn test_qp_dump_reproduces_solution() {
    let mut original = DenseActiveSetQp::new(QpType::Qp, 2, 1, 100, 0., true);
    let mut hessian = SparseTripletMatrix::new(2, 2, vec![0, 1], vec![0, 1], true).unwrap();
    hessian.set_values(&[2., 2.]);
    original.set_objective_hessian(&hessian);
    original.set_linear_objective_coefficient(0, -2.);
    original.set_linear_objective_coefficient(1, -5.);
    let mut jacobian = HarwellBoeingMatrix::from_structure(
        StorageOrientation::RowCompressed,
        1,
        2,
        &[0, 0],
        &[0, 1],
        &Default::default(),
    )
    .unwrap();
    jacobian.update_values(&[1., 1.]);
    original.set_constraint_jacobian(&jacobian);
    original.set_lower_constraint_bound(0, -SQP_INFINITY);
    original.set_upper_constraint_bound(0, 2.);
    for i in 0..2 {
        original.set_lower_variable_bound(i, -5.);
        original.set_upper_variable_bound(i, 5.);
    }

    let mut stats = Statistics::new();
    assert_eq!(original.optimize(&mut stats), QpStatus::Optimal);

    let file = tempfile::NamedTempFile::new().unwrap();
    original.write_qp_data_to_file(file.path()).unwrap();
    let dump = QpDump::read_from_file(file.path()).unwrap();

    // Rebuild a fresh back-end from the dumped data.
    let n = dump.num_variables;
    let m = dump.num_constraints;
    let mut replay = DenseActiveSetQp::new(QpType::Qp, n, m, 100, 0., true);

    let mut hessian_rows = Vec::new();
    let mut hessian_cols = Vec::new();
    let mut hessian_values = Vec::new();
    for row in 0..n {
        for col in 0..=row {
            if dump.hessian[(row, col)] != 0. {
                hessian_rows.push(row);
                hessian_cols.push(col);
                hessian_values.push(dump.hessian[(row, col)]);
            }
        }
    }
    let mut replay_hessian =
        SparseTripletMatrix::new(n, n, hessian_rows, hessian_cols, true).unwrap();
    replay_hessian.set_values(&hessian_values);
    replay.set_objective_hessian(&replay_hessian);

    let mut jacobian_rows = Vec::new();
    let mut jacobian_cols = Vec::new();
    let mut jacobian_values = Vec::new();
    for row in 0..m {
        for col in 0..n {
            if dump.jacobian[(row, col)] != 0. {
                jacobian_rows.push(row);
                jacobian_cols.push(col);
                jacobian_values.push(dump.jacobian[(row, col)]);
            }
        }
    }
    let mut replay_jacobian = HarwellBoeingMatrix::from_structure(
        StorageOrientation::RowCompressed,
        m,
        n,
        &jacobian_rows,
        &jacobian_cols,
        &Default::default(),
    )
    .unwrap();
    replay_jacobian.update_values(&jacobian_values);
    replay.set_constraint_jacobian(&replay_jacobian);

    for i in 0..n {
        replay.set_linear_objective_coefficient(i, dump.linear_objective[i]);
        replay.set_lower_variable_bound(i, dump.lower_variable_bounds[i]);
        replay.set_upper_variable_bound(i, dump.upper_variable_bounds[i]);
    }
    for j in 0..m {
        replay.set_lower_constraint_bound(j, dump.lower_constraint_bounds[j]);
        replay.set_upper_constraint_bound(j, dump.upper_constraint_bounds[j]);
    }

    assert_eq!(replay.optimize(&mut stats), QpStatus::Optimal);

    let x = original.get_primal_solution();
    let y = replay.get_primal_solution();
    for i in 0..n {
        assert!((x[i] - y[i]).abs() < 1e-9);
    }
    for j in 0..m {
        assert!(
            (original.get_constraint_multipliers()[j] - replay.get_constraint_multipliers()[j])
                .abs()
                < 1e-9
        );
    }
    assert_eq!(
        original.get_constraints_working_set(),
        replay.get_constraints_working_set()
    );
    assert!(
        (original.get_optimal_objective_value() - replay.get_optimal_objective_value()).abs()
            < 1e-9
    );
}
