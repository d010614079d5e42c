//! Watchdog state machine for non-monotone step acceptance.
//!
//! After a rejected trial step the watchdog tentatively accepts it anyway
//! and gives the next iteration a chance to recover; if that fails too, the
//! snapshot taken at arming time is restored and the watchdog sleeps for a
//! number of iterations.

use faer::Col;

use crate::E;
use crate::linalg::triplet::SparseTripletMatrix;

/// State of the watchdog procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    /// Watchdog technique is switched off.
    Inactive,
    /// Armed; the next rejected step starts a trial iteration.
    Ready,
    /// A rejected step was tentatively accepted; deciding on the outcome.
    InTrial,
    /// Waiting after a failed trial before re-arming.
    Sleeping,
}

/// Snapshot of the iterate taken when the watchdog is armed.
///
/// Created at arming, consumed at either acceptance or rollback.  The
/// engine never reads through an absent snapshot.
#[derive(Debug, Clone)]
pub struct WatchdogBackup {
    pub current_iterate: Col<E>,
    pub current_bound_multipliers: Col<E>,
    pub current_constraint_multipliers: Col<E>,

    pub current_objective_value: E,
    pub current_objective_gradient: Col<E>,
    pub current_constraint_values: Col<E>,
    pub current_constraint_jacobian: SparseTripletMatrix,
    pub current_lagrangian_hessian: SparseTripletMatrix,

    pub current_infeasibility: E,
    pub predicted_reduction: E,
    pub penalty_parameter: E,
    pub trust_region_radius: E,

    pub trial_step: Col<E>,
    pub trial_bound_multipliers: Col<E>,
    pub trial_constraint_multipliers: Col<E>,
    pub trial_model_infeasibility: E,
}
