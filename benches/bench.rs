//! Micro-benchmarks for the dense active-set QP back-end.

use resqp::linalg::harwell_boeing::{HarwellBoeingMatrix, StorageOrientation};
use resqp::linalg::triplet::SparseTripletMatrix;
use resqp::qp::active_set::DenseActiveSetQp;
use resqp::qp::{QpSolverInterface, QpType};
use resqp::stats::Statistics;
use resqp::{E, I};

fn main() {
    divan::main();
}

const N: I = 30;

fn build_solver(cold_start: bool) -> DenseActiveSetQp {
    let mut solver = DenseActiveSetQp::new(QpType::Qp, N, 1, 10000, 0., cold_start);

    let mut hessian =
        SparseTripletMatrix::new(N, N, (0..N).collect(), (0..N).collect(), true).unwrap();
    hessian.set_values(&vec![2.; N]);
    solver.set_objective_hessian(&hessian);

    let rows = vec![0; N];
    let cols: Vec<I> = (0..N).collect();
    let mut jacobian = HarwellBoeingMatrix::from_structure(
        StorageOrientation::RowCompressed,
        1,
        N,
        &rows,
        &cols,
        &Default::default(),
    )
    .unwrap();
    jacobian.update_values(&vec![1.; N]);
    solver.set_constraint_jacobian(&jacobian);
    solver.set_lower_constraint_bound(0, -1e18);
    solver.set_upper_constraint_bound(0, 1.);

    for i in 0..N {
        solver.set_linear_objective_coefficient(i, -(i as E) / N as E - 0.5);
        solver.set_lower_variable_bound(i, -1.);
        solver.set_upper_variable_bound(i, 1.);
    }
    solver
}

#[divan::bench]
fn qp_cold_solve(bencher: divan::Bencher) {
    bencher.bench_local(|| {
        let mut solver = build_solver(true);
        let mut stats = Statistics::new();
        solver.optimize(&mut stats)
    });
}

#[divan::bench]
fn qp_warm_resolve(bencher: divan::Bencher) {
    let mut solver = build_solver(false);
    let mut stats = Statistics::new();
    solver.optimize(&mut stats);
    bencher.bench_local(move || {
        // Perturb the gradient and hot-start from the previous working set.
        solver.set_linear_objective_coefficient(0, -0.49);
        solver.optimize(&mut stats)
    });
}
