//! Hooks invoked once per solver iteration for logging and monitoring.

use crate::kkt::KktError;
use crate::nlp::NlpInfo;
use crate::{E, I, SqpExitStatus};

/// Per-iteration quantities handed to a [`Callback`].
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: I,
    /// Objective value in the user's (unscaled) sense.
    pub objective_value: E,
    /// ℓ₁ constraint violation at the current iterate.
    pub infeasibility: E,
    /// ∞-norm of the trial step.
    pub step_norm: E,
    pub trust_region_radius: E,
    /// Ratio of actual to predicted merit reduction.
    pub ratio: E,
    pub penalty_parameter: E,
    pub qp_kkt_error: E,
    pub num_qp_iterations: I,
    pub nlp_kkt_error: E,
    /// Short markers for events in this iteration (e.g. watchdog states).
    pub info: String,
}

/// Final quantities handed to a [`Callback`] when the solve ends.
#[derive(Debug, Clone)]
pub struct FinalSummary {
    pub status: SqpExitStatus,
    pub num_variables: I,
    pub num_equality_constraints: I,
    pub num_inequality_constraints: I,
    pub num_sqp_iterations: I,
    pub num_qp_iterations: I,
    /// Objective value in the user's (unscaled) sense.
    pub objective_value: E,
    pub kkt_error: KktError,
    pub infeasibility: E,
    pub cpu_seconds: E,
    pub wallclock_seconds: E,
}

/// Hook invoked at solver milestones for logging, monitoring, or journaling.
pub trait Callback {
    /// Called once before the first iteration.
    fn on_solve_start(&mut self, nlp_info: &NlpInfo, record: &IterationRecord) {
        let _ = (nlp_info, record);
    }

    /// Called at the end of each iteration.
    fn call(&mut self, record: &IterationRecord);

    /// Called for noteworthy events (warnings, penalty updates).
    fn on_message(&mut self, message: &str) {
        let _ = message;
    }

    /// Called once after the loop has finished.
    fn on_finish(&mut self, summary: &FinalSummary) {
        let _ = summary;
    }
}

/// A callback that does nothing.  Use when no per-iteration output is
/// needed.
pub struct NoOpCallback {}

impl Callback for NoOpCallback {
    fn call(&mut self, _record: &IterationRecord) {
        // Do nothing
    }
}

/// Prints the iteration summary table to stdout.
pub struct IterationOutput {
    header_interval: I,
}

impl IterationOutput {
    pub fn new() -> Self {
        Self {
            header_interval: 10,
        }
    }

    fn print_header(&self) {
        println!("{}", "=".repeat(112));
        println!(
            "{:>6} {:>23} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>6} {:>9}",
            "iter",
            "objective",
            "||c_k||",
            "||p_k||",
            "Delta",
            "ratio",
            "pen par",
            "QP_KKT",
            "QP it",
            "NLP_KKT"
        );
        println!("{}", "=".repeat(112));
    }
}

impl Default for IterationOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for IterationOutput {
    fn on_solve_start(&mut self, nlp_info: &NlpInfo, record: &IterationRecord) {
        println!("Solving NLP {}", nlp_info.name);
        println!(
            "Number of variables.....................: {:>10}",
            nlp_info.num_variables
        );
        println!(
            "Number of constraints...................: {:>10}",
            nlp_info.num_constraints
        );
        println!();
        self.print_header();
        self.call(record);
    }

    fn call(&mut self, record: &IterationRecord) {
        if record.iteration > 0 && record.iteration % self.header_interval == 0 {
            self.print_header();
        }
        println!(
            "{:>6} {:>23.16e} {:>9.3e} {:>9.3e} {:>9.3e} {:>9.3e} {:>9.3e} {:>9.3e} {:>6} {:>9.3e} {}",
            record.iteration,
            record.objective_value,
            record.infeasibility,
            record.step_norm,
            record.trust_region_radius,
            record.ratio,
            record.penalty_parameter,
            record.qp_kkt_error,
            record.num_qp_iterations,
            record.nlp_kkt_error,
            record.info,
        );
    }

    fn on_message(&mut self, message: &str) {
        println!("{message}");
    }

    fn on_finish(&mut self, summary: &FinalSummary) {
        println!("{}", "=".repeat(112));
        println!();
        println!(
            "Exit status............................:  {}",
            summary.status.message()
        );
        println!(
            "Number of variables....................:  {}",
            summary.num_variables
        );
        println!(
            "Number of equality constraints.........:  {}",
            summary.num_equality_constraints
        );
        println!(
            "Number of inequality constraints.......:  {}",
            summary.num_inequality_constraints
        );
        println!(
            "Number of major iterations.............:  {}",
            summary.num_sqp_iterations
        );
        println!(
            "Number of QP solver iterations.........:  {}",
            summary.num_qp_iterations
        );
        println!(
            "Final objective........................: {:>23.16e}",
            summary.objective_value
        );
        println!(
            "Constraint violation...................: {:>23.16e}",
            summary.kkt_error.primal_infeasibility
        );
        println!(
            "Dual infeasibility.....................: {:>23.16e}",
            summary.kkt_error.dual_infeasibility
        );
        println!(
            "Complementarity violation..............: {:>23.16e}",
            summary.kkt_error.complementarity_violation
        );
        println!(
            "||c_k||................................: {:>23.16e}",
            summary.infeasibility
        );
        println!(
            "CPU time used..........................: {:>12.4} secs",
            summary.cpu_seconds
        );
        println!(
            "Wall clock time passed.................: {:>12.4} secs",
            summary.wallclock_seconds
        );
    }
}
