//! # resqp
//!
//! A trust-region sequential quadratic programming (SQP) solver for smooth
//! nonlinear programs of the form
//!
//! ```text
//!   min  f(x)
//!   s.t. c_L <= c(x) <= c_U
//!        x_L <=  x   <= x_U
//! ```
//!
//! The distinguishing capability is warm starting: a solve can be restarted
//! from a previously identified primal-dual iterate *and* the working set of
//! active bounds and constraints, which lets the active-set QP subproblem
//! solver hot-start from the previous solution.
//!
//! Steps are computed from an ℓ₁-penalty quadratic subproblem, the penalty
//! parameter is steered by an auxiliary feasibility LP, and acceptance is
//! decided by a ratio test with a watchdog heuristic.  See [`sqp::SqpSolver`]
//! for the entry points.

use std::any::Any;

use dyn_clone::DynClone;

pub mod callback;
pub mod kkt;
pub mod linalg;
pub mod nlp;
pub mod options;
pub mod qp;
pub mod sqp;
pub mod stats;
pub mod terminators;

#[cfg(test)]
pub mod tests;

/// Scalar element type used throughout the solver.
pub type E = f64;
/// Index type used throughout the solver.
pub type I = usize;

/// Value beyond which a bound is treated as infinite.
pub const SQP_INFINITY: E = 1e18;

pub use nlp::{NlpInfo, NlpProblem};
pub use options::Options;
pub use qp::working_set::ActivityStatus;
pub use sqp::SqpSolver;
pub use stats::Statistics;

pub trait OptionTrait: Any + Sync + Send + DynClone {}
impl OptionTrait for &'static str {}
impl OptionTrait for String {}
impl OptionTrait for bool {}
impl OptionTrait for usize {}
impl OptionTrait for u8 {}
impl OptionTrait for u16 {}
impl OptionTrait for u32 {}
impl OptionTrait for u64 {}
impl OptionTrait for i8 {}
impl OptionTrait for i16 {}
impl OptionTrait for i32 {}
impl OptionTrait for i64 {}
impl OptionTrait for f32 {}
impl OptionTrait for f64 {}

impl Clone for Box<dyn OptionTrait> {
    fn clone(&self) -> Self {
        dyn_clone::clone_box(&**self)
    }
}

/// Exit statuses of the SQP solver.
///
/// The integer values are stable and shared with non-Rust callers; see
/// [`SqpExitStatus::code`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum SqpExitStatus {
    /// An optimal solution was found.
    Optimal = 0,
    /// The iterates converged to a non-optimal point.
    ConvergeToNonoptimal = 1,
    /// The NLP data is invalid (inconsistent sizes or bounds).
    InvalidNlp = -1,
    /// The maximum number of SQP iterations was exceeded.
    ExceedMaxIterations = -2,
    /// The predicted reduction of the merit function was non-positive.
    PredReductionNegative = -3,
    /// The trust-region radius fell below its minimum value.
    TrustRegionTooSmall = -4,
    /// The CPU time limit was exceeded.
    ExceedMaxCpuTime = -6,
    /// The wallclock time limit was exceeded.
    ExceedMaxWallclockTime = -7,
    /// The penalty parameter reached its maximum value.
    PenaltyTooLarge = -8,
    /// Reserved for the lazy-constraint driver.
    ExceedMaxLazyNlpSolves = -9,
    /// Reserved for the lazy-constraint driver.
    ErrorInLazyNlpUpdate = -10,
    /// The user-provided initial working set marks too many entries active.
    InvalidInitialWorkingSet = -11,
    /// The QP solver reported an internal error.
    QpErrorInternal = -21,
    /// The QP solver concluded that the subproblem is infeasible.
    QpErrorInfeasible = -22,
    /// The QP solver concluded that the subproblem is unbounded.
    QpErrorUnbounded = -23,
    /// The QP solver exceeded its internal iteration limit.
    QpErrorExceedMaxIter = -24,
    /// The QP solver was used before being initialized.
    QpErrorNotInitialized = -25,
    /// The QP solver failed in an unclassified way.
    QpErrorUnknown = -30,
    /// The solver was interrupted (e.g. by Ctrl-C).
    Interrupted = -50,
    #[default]
    /// The solver has not finished (or failed in an unclassified way).
    UnknownExitStatus = -99,
}

impl SqpExitStatus {
    /// The stable integer code of this exit status.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// A short human-readable message for the final summary output.
    pub fn message(self) -> &'static str {
        match self {
            SqpExitStatus::Optimal => "Optimal solution found.",
            SqpExitStatus::ConvergeToNonoptimal => "Converged to a non-optimal point.",
            SqpExitStatus::InvalidNlp => "Error: Invalid NLP.",
            SqpExitStatus::ExceedMaxIterations => "Maximum number of iterations exceeded.",
            SqpExitStatus::PredReductionNegative => "Error: Predicted reduction is non-positive.",
            SqpExitStatus::TrustRegionTooSmall => "Trust region becomes too small.",
            SqpExitStatus::ExceedMaxCpuTime => "CPU time limit exceeded.",
            SqpExitStatus::ExceedMaxWallclockTime => "Wallclock time limit exceeded.",
            SqpExitStatus::PenaltyTooLarge => "Penalty parameter becomes too large.",
            SqpExitStatus::ExceedMaxLazyNlpSolves => "Maximum number of lazy NLP solves exceeded.",
            SqpExitStatus::ErrorInLazyNlpUpdate => "Error while updating the lazy NLP.",
            SqpExitStatus::InvalidInitialWorkingSet => "Error: Invalid initial working set.",
            SqpExitStatus::QpErrorInternal => "Error: QP solver internal error.",
            SqpExitStatus::QpErrorInfeasible => {
                "Error: QP solver claims that the QP is infeasible."
            }
            SqpExitStatus::QpErrorUnbounded => "Error: QP solver claims that the QP is unbounded.",
            SqpExitStatus::QpErrorExceedMaxIter => {
                "Error: QP solver exceeded internal iteration limit."
            }
            SqpExitStatus::QpErrorNotInitialized => "Error: QP solver was not initialized.",
            SqpExitStatus::QpErrorUnknown => "Error: Unknown QP solver error.",
            SqpExitStatus::Interrupted => "Solve was interrupted.",
            SqpExitStatus::UnknownExitStatus => "Error: Unknown exit status.",
        }
    }
}

/// Fatal error conditions raised inside the SQP iteration loop.
///
/// These are caught at the top level of a solve and translated into the
/// corresponding [`SqpExitStatus`]; the caller still receives the last known
/// iterate and working set.
#[derive(Debug, derive_more::Display, derive_more::Error, PartialEq)]
pub enum SqpError {
    #[display("Invalid NLP: {_0}")]
    InvalidNlp(#[error(not(source))] String),

    #[display("The initial working set marks too many entries as active")]
    InvalidInitialWorkingSet,

    #[display("Penalty parameter becomes too large")]
    PenaltyTooLarge,

    #[display("Trust region radius becomes too small")]
    TrustRegionTooSmall,

    #[display("QP solver claims that the subproblem is infeasible")]
    QpInfeasible,

    #[display("QP solver claims that the subproblem is unbounded")]
    QpUnbounded,

    #[display("QP solver exceeded its iteration limit")]
    QpIterLimit,

    #[display("QP solver encountered an internal error")]
    QpInternalError,

    #[display("QP solver was used before being initialized")]
    QpNotInitialized,

    #[display("QP solver failed for an unclassified reason")]
    QpUnknown,
}

impl SqpError {
    /// The exit status that this fatal condition maps to.
    pub fn exit_status(&self) -> SqpExitStatus {
        match self {
            SqpError::InvalidNlp(_) => SqpExitStatus::InvalidNlp,
            SqpError::InvalidInitialWorkingSet => SqpExitStatus::InvalidInitialWorkingSet,
            SqpError::PenaltyTooLarge => SqpExitStatus::PenaltyTooLarge,
            SqpError::TrustRegionTooSmall => SqpExitStatus::TrustRegionTooSmall,
            SqpError::QpInfeasible => SqpExitStatus::QpErrorInfeasible,
            SqpError::QpUnbounded => SqpExitStatus::QpErrorUnbounded,
            SqpError::QpIterLimit => SqpExitStatus::QpErrorExceedMaxIter,
            SqpError::QpInternalError => SqpExitStatus::QpErrorInternal,
            SqpError::QpNotInitialized => SqpExitStatus::QpErrorNotInitialized,
            SqpError::QpUnknown => SqpExitStatus::QpErrorUnknown,
        }
    }
}
