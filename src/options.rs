//! Runtime option registry for the SQP solver.
//!
//! Options are stored by name in a map of type-erased values and accessed
//! through typed getters and setters.  The registry is seeded with the
//! default value of every recognized option; setting an unknown option or
//! using the wrong type is an error.  A typed snapshot of all values,
//! [`SqpOptions`], is materialized once per solve.

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use derive_more::{Display, Error};
use problemo::Problem;

use crate::{E, I, OptionTrait};

#[derive(Debug, Display, Error, PartialEq)]
pub enum OptionsError {
    #[display("Option '{_0}' is not registered")]
    UnknownOption(#[error(not(source))] String),

    #[display("Type mismatch for option '{_0}'")]
    TypeMismatch(#[error(not(source))] String),

    #[display("Cannot parse value '{_1}' for option '{_0}'")]
    ParseError(String, #[error(not(source))] String),

    #[display("Invalid value for option '{_0}': {_1}")]
    InvalidValue(String, #[error(not(source))] String),

    #[display("Cannot read options file '{_0}'")]
    FileError(#[error(not(source))] String),
}

static OPTION_REGISTRY: LazyLock<HashMap<String, Box<dyn OptionTrait>>> = LazyLock::new(|| {
    let mut map: HashMap<String, Box<dyn OptionTrait>> = HashMap::new();

    fn opt<T: OptionTrait>(map: &mut HashMap<String, Box<dyn OptionTrait>>, name: &str, value: T) {
        map.insert(name.to_string(), Box::new(value));
    }

    // General
    opt(&mut map, "starting_mode", "primal-dual".to_string());
    opt(&mut map, "max_num_iterations", 3000 as I);
    opt(&mut map, "cpu_time_limit", 1e10 as E);
    opt(&mut map, "wallclock_time_limit", 1e10 as E);
    opt(&mut map, "objective_scaling_factor", 1.0 as E);
    opt(&mut map, "slack_formulation", false);
    opt(&mut map, "perform_second_order_correction", false);
    opt(&mut map, "print_level", 1 as I);

    // Trust region
    opt(&mut map, "trust_region_init_size", 10.0 as E);
    opt(&mut map, "trust_region_max_value", 1e10 as E);
    opt(&mut map, "trust_region_min_value", 1e-16 as E);
    opt(&mut map, "trust_region_ratio_decrease_tol", 1e-8 as E);
    opt(&mut map, "trust_region_ratio_accept_tol", 1e-8 as E);
    opt(&mut map, "trust_region_ratio_increase_tol", 1e-8 as E);
    opt(&mut map, "trust_region_decrease_factor", 0.5 as E);
    opt(&mut map, "trust_region_increase_factor", 2.0 as E);
    opt(&mut map, "disable_trust_region", false);
    opt(&mut map, "watchdog_min_wait_iterations", 10 as I);

    // Penalty update
    opt(&mut map, "penalty_parameter_init_value", 10.0 as E);
    opt(&mut map, "penalty_update_tol", 1e-8 as E);
    opt(&mut map, "penalty_parameter_increase_factor", 10.0 as E);
    opt(&mut map, "penalty_parameter_max_value", 1e12 as E);
    opt(&mut map, "eps1", 0.1 as E);
    opt(&mut map, "eps1_change_parm", 0.1 as E);
    opt(&mut map, "eps2", 1e-6 as E);
    opt(&mut map, "penalty_iter_max", 200 as I);

    // Optimality test
    opt(&mut map, "opt_tol", 1e-6 as E);
    opt(&mut map, "opt_tol_primal_feasibility", 1e-6 as E);
    opt(&mut map, "opt_tol_dual_feasibility", 1e-6 as E);
    opt(&mut map, "opt_tol_complementarity", 1e-6 as E);
    opt(&mut map, "active_set_tol", 1e-5 as E);

    // QP solver
    opt(&mut map, "qp_solver", "dense-active-set".to_string());
    opt(&mut map, "qp_solver_max_num_iterations", 100000 as I);
    opt(&mut map, "lp_solver_max_num_iterations", 100000 as I);
    opt(&mut map, "qp_solver_print_level", 0 as I);
    opt(&mut map, "qp_init_primal_variables", false);
    opt(&mut map, "qp_hessian_regularization", 0.0 as E);

    map
});

/// Option registry with the recognized options and their current values.
#[derive(Clone)]
pub struct Options {
    map: HashMap<String, Box<dyn OptionTrait>>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    /// Creates a registry populated with the default value of every option.
    pub fn new() -> Self {
        let map = OPTION_REGISTRY.clone();
        Self { map }
    }

    /// Returns the value of the option `name`, or `None` if the option does
    /// not exist or is stored with a different type.
    pub fn get_option<T: OptionTrait + Clone>(&self, name: &str) -> Option<T> {
        self.map
            .get(name)
            .and_then(|v| (v.as_ref() as &dyn Any).downcast_ref::<T>())
            .cloned()
    }

    /// Sets the option `name` to `value`.  The option must be registered and
    /// the type must match the registered type.
    pub fn set_option<T: OptionTrait>(&mut self, name: &str, value: T) -> Result<(), Problem> {
        let current = self
            .map
            .get(name)
            .ok_or_else(|| OptionsError::UnknownOption(name.to_string()))?;
        if (current.as_ref() as &dyn Any).downcast_ref::<T>().is_none() {
            return Err(OptionsError::TypeMismatch(name.to_string()))?;
        }
        self.map.insert(name.to_string(), Box::new(value));
        Ok(())
    }

    /// Sets an option from its textual representation, converting to the
    /// registered type.  Booleans accept `yes`/`no`/`true`/`false`.
    pub fn set_from_string(&mut self, name: &str, value: &str) -> Result<(), Problem> {
        let current = self
            .map
            .get(name)
            .ok_or_else(|| OptionsError::UnknownOption(name.to_string()))?;
        let current = current.as_ref() as &dyn Any;

        let parse_err = || OptionsError::ParseError(name.to_string(), value.to_string());

        let parsed: Box<dyn OptionTrait> = if current.downcast_ref::<bool>().is_some() {
            match value {
                "yes" | "true" => Box::new(true),
                "no" | "false" => Box::new(false),
                _ => return Err(parse_err())?,
            }
        } else if current.downcast_ref::<I>().is_some() {
            Box::new(value.parse::<I>().map_err(|_| parse_err())?)
        } else if current.downcast_ref::<E>().is_some() {
            Box::new(value.parse::<E>().map_err(|_| parse_err())?)
        } else {
            Box::new(value.to_string())
        };

        self.map.insert(name.to_string(), parsed);
        Ok(())
    }

    /// Reads options from a file with one `name value` pair per line.
    /// Empty lines and lines starting with `#` are skipped.
    pub fn read_from_file(&mut self, path: &Path) -> Result<(), Problem> {
        let contents = fs::read_to_string(path)
            .map_err(|_| OptionsError::FileError(path.display().to_string()))?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap();
            let value = parts
                .next()
                .ok_or_else(|| OptionsError::ParseError(name.to_string(), String::new()))?;
            self.set_from_string(name, value)?;
        }
        Ok(())
    }
}

/// How much starting information the NLP provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingMode {
    /// Only the primal starting point is used; multipliers start at zero.
    PrimalOnly,
    /// Primal and dual starting values are used.
    PrimalDual,
    /// Primal-dual starting point plus an initial working set.
    WarmStart,
}

/// Typed snapshot of all option values, taken once at the beginning of a
/// solve.  Construction validates ranges.
#[derive(Debug, Clone)]
pub struct SqpOptions {
    pub starting_mode: StartingMode,
    pub max_num_iterations: I,
    pub cpu_time_limit: E,
    pub wallclock_time_limit: E,
    pub objective_scaling_factor: E,
    pub slack_formulation: bool,
    pub perform_second_order_correction: bool,
    pub print_level: I,

    pub trust_region_init_size: E,
    pub trust_region_max_value: E,
    pub trust_region_min_value: E,
    pub trust_region_ratio_decrease_tol: E,
    pub trust_region_ratio_accept_tol: E,
    pub trust_region_ratio_increase_tol: E,
    pub trust_region_decrease_factor: E,
    pub trust_region_increase_factor: E,
    pub disable_trust_region: bool,
    pub watchdog_min_wait_iterations: I,

    pub penalty_parameter_init_value: E,
    pub penalty_update_tol: E,
    pub penalty_parameter_increase_factor: E,
    pub penalty_parameter_max_value: E,
    pub eps1: E,
    pub eps1_change_parm: E,
    pub eps2: E,
    pub penalty_iter_max: I,

    pub opt_tol: E,
    pub opt_tol_primal_feasibility: E,
    pub opt_tol_dual_feasibility: E,
    pub opt_tol_complementarity: E,
    pub active_set_tol: E,

    pub qp_solver: String,
    pub qp_solver_max_num_iterations: I,
    pub lp_solver_max_num_iterations: I,
    pub qp_solver_print_level: I,
    pub qp_init_primal_variables: bool,
    pub qp_hessian_regularization: E,
}

impl SqpOptions {
    pub fn from_options(options: &Options) -> Result<Self, Problem> {
        fn num(options: &Options, name: &str) -> Result<E, Problem> {
            options
                .get_option::<E>(name)
                .ok_or_else(|| OptionsError::UnknownOption(name.to_string()).into())
        }
        fn int(options: &Options, name: &str) -> Result<I, Problem> {
            options
                .get_option::<I>(name)
                .ok_or_else(|| OptionsError::UnknownOption(name.to_string()).into())
        }
        fn flag(options: &Options, name: &str) -> Result<bool, Problem> {
            options
                .get_option::<bool>(name)
                .ok_or_else(|| OptionsError::UnknownOption(name.to_string()).into())
        }

        let starting_mode = match options.get_option::<String>("starting_mode").as_deref() {
            Some("primal") => StartingMode::PrimalOnly,
            Some("primal-dual") => StartingMode::PrimalDual,
            Some("warm-start") => StartingMode::WarmStart,
            other => {
                return Err(OptionsError::InvalidValue(
                    "starting_mode".to_string(),
                    other.unwrap_or("<missing>").to_string(),
                ))?;
            }
        };

        let retval = Self {
            starting_mode,
            max_num_iterations: int(options, "max_num_iterations")?,
            cpu_time_limit: num(options, "cpu_time_limit")?,
            wallclock_time_limit: num(options, "wallclock_time_limit")?,
            objective_scaling_factor: num(options, "objective_scaling_factor")?,
            slack_formulation: flag(options, "slack_formulation")?,
            perform_second_order_correction: flag(options, "perform_second_order_correction")?,
            print_level: int(options, "print_level")?,

            trust_region_init_size: num(options, "trust_region_init_size")?,
            trust_region_max_value: num(options, "trust_region_max_value")?,
            trust_region_min_value: num(options, "trust_region_min_value")?,
            trust_region_ratio_decrease_tol: num(options, "trust_region_ratio_decrease_tol")?,
            trust_region_ratio_accept_tol: num(options, "trust_region_ratio_accept_tol")?,
            trust_region_ratio_increase_tol: num(options, "trust_region_ratio_increase_tol")?,
            trust_region_decrease_factor: num(options, "trust_region_decrease_factor")?,
            trust_region_increase_factor: num(options, "trust_region_increase_factor")?,
            disable_trust_region: flag(options, "disable_trust_region")?,
            watchdog_min_wait_iterations: int(options, "watchdog_min_wait_iterations")?,

            penalty_parameter_init_value: num(options, "penalty_parameter_init_value")?,
            penalty_update_tol: num(options, "penalty_update_tol")?,
            penalty_parameter_increase_factor: num(options, "penalty_parameter_increase_factor")?,
            penalty_parameter_max_value: num(options, "penalty_parameter_max_value")?,
            eps1: num(options, "eps1")?,
            eps1_change_parm: num(options, "eps1_change_parm")?,
            eps2: num(options, "eps2")?,
            penalty_iter_max: int(options, "penalty_iter_max")?,

            opt_tol: num(options, "opt_tol")?,
            opt_tol_primal_feasibility: num(options, "opt_tol_primal_feasibility")?,
            opt_tol_dual_feasibility: num(options, "opt_tol_dual_feasibility")?,
            opt_tol_complementarity: num(options, "opt_tol_complementarity")?,
            active_set_tol: num(options, "active_set_tol")?,

            qp_solver: options
                .get_option::<String>("qp_solver")
                .unwrap_or_default(),
            qp_solver_max_num_iterations: int(options, "qp_solver_max_num_iterations")?,
            lp_solver_max_num_iterations: int(options, "lp_solver_max_num_iterations")?,
            qp_solver_print_level: int(options, "qp_solver_print_level")?,
            qp_init_primal_variables: flag(options, "qp_init_primal_variables")?,
            qp_hessian_regularization: num(options, "qp_hessian_regularization")?,
        };

        retval.validate()?;
        Ok(retval)
    }

    fn validate(&self) -> Result<(), Problem> {
        fn check(cond: bool, name: &str, why: &str) -> Result<(), Problem> {
            if !cond {
                return Err(OptionsError::InvalidValue(name.to_string(), why.to_string()))?;
            }
            Ok(())
        }

        check(
            self.objective_scaling_factor > 0.,
            "objective_scaling_factor",
            "must be positive",
        )?;
        check(
            self.trust_region_init_size > 0.,
            "trust_region_init_size",
            "must be positive",
        )?;
        check(
            self.trust_region_decrease_factor > 0. && self.trust_region_decrease_factor < 1.,
            "trust_region_decrease_factor",
            "must be in (0,1)",
        )?;
        check(
            self.trust_region_increase_factor >= 1.,
            "trust_region_increase_factor",
            "must be at least 1",
        )?;
        check(
            self.trust_region_ratio_accept_tol > 0. && self.trust_region_ratio_accept_tol < 1.,
            "trust_region_ratio_accept_tol",
            "must be in (0,1)",
        )?;
        check(
            self.penalty_parameter_init_value > 0.,
            "penalty_parameter_init_value",
            "must be positive",
        )?;
        check(
            self.penalty_parameter_increase_factor > 1.,
            "penalty_parameter_increase_factor",
            "must be greater than 1",
        )?;
        check(
            self.qp_solver == "dense-active-set",
            "qp_solver",
            "the only available back-end is 'dense-active-set'",
        )?;
        check(
            self.qp_hessian_regularization >= 0.,
            "qp_hessian_regularization",
            "must be non-negative",
        )?;
        Ok(())
    }
}
