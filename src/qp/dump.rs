//! Deterministic text dump of a QP subproblem.
//!
//! When a QP solve fails, the offending data is written to disk so the
//! subproblem can be reproduced standalone.  The format is plain text with
//! named dense arrays: the vectors `g`, `lb`, `ub`, `lbA`, `ubA` and the
//! row-major matrices `H_values` and `A_values`.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use derive_more::{Display, Error};
use faer::{Col, Mat};
use problemo::Problem;

use crate::{E, I};

#[derive(Debug, Display, Error, PartialEq)]
pub enum DumpError {
    #[display("Cannot write QP data file '{_0}'")]
    WriteFailed(#[error(not(source))] String),

    #[display("Cannot read QP data file '{_0}'")]
    ReadFailed(#[error(not(source))] String),

    #[display("QP data file is malformed: {_0}")]
    Malformed(#[error(not(source))] String),
}

/// The full data of one QP subproblem, in dense form.
#[derive(Debug, Clone)]
pub struct QpDump {
    pub num_variables: I,
    pub num_constraints: I,
    pub linear_objective: Col<E>,
    pub lower_variable_bounds: Col<E>,
    pub upper_variable_bounds: Col<E>,
    pub lower_constraint_bounds: Col<E>,
    pub upper_constraint_bounds: Col<E>,
    pub hessian: Mat<E>,
    pub jacobian: Mat<E>,
}

fn push_vector(out: &mut String, name: &str, vector: &Col<E>) {
    writeln!(out, "{name} {}", vector.nrows()).unwrap();
    for i in 0..vector.nrows() {
        writeln!(out, "{:.17e}", vector[i]).unwrap();
    }
}

fn push_matrix(out: &mut String, name: &str, matrix: &Mat<E>) {
    writeln!(out, "{name} {} {}", matrix.nrows(), matrix.ncols()).unwrap();
    for row in 0..matrix.nrows() {
        for col in 0..matrix.ncols() {
            writeln!(out, "{:.17e}", matrix[(row, col)]).unwrap();
        }
    }
}

impl QpDump {
    pub fn write_to_file(&self, path: &Path) -> Result<(), Problem> {
        let mut out = String::new();
        writeln!(out, "num_variables {}", self.num_variables).unwrap();
        writeln!(out, "num_constraints {}", self.num_constraints).unwrap();
        push_vector(&mut out, "g", &self.linear_objective);
        push_vector(&mut out, "lb", &self.lower_variable_bounds);
        push_vector(&mut out, "ub", &self.upper_variable_bounds);
        push_vector(&mut out, "lbA", &self.lower_constraint_bounds);
        push_vector(&mut out, "ubA", &self.upper_constraint_bounds);
        push_matrix(&mut out, "H_values", &self.hessian);
        push_matrix(&mut out, "A_values", &self.jacobian);
        fs::write(path, out).map_err(|_| DumpError::WriteFailed(path.display().to_string()))?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self, Problem> {
        let contents = fs::read_to_string(path)
            .map_err(|_| DumpError::ReadFailed(path.display().to_string()))?;
        let mut lines = contents.lines();

        fn header(line: Option<&str>, name: &str) -> Result<Vec<I>, Problem> {
            let line = line.ok_or_else(|| DumpError::Malformed(format!("missing '{name}'")))?;
            let mut parts = line.split_whitespace();
            let found = parts.next().unwrap_or("");
            if found != name {
                return Err(DumpError::Malformed(format!(
                    "expected '{name}', found '{found}'"
                )))?;
            }
            let mut sizes = Vec::new();
            for part in parts {
                sizes.push(
                    part.parse::<I>()
                        .map_err(|_| DumpError::Malformed(format!("bad size in '{name}'")))?,
                );
            }
            Ok(sizes)
        }

        fn values(
            lines: &mut std::str::Lines<'_>,
            count: I,
            name: &str,
        ) -> Result<Vec<E>, Problem> {
            let mut vals = Vec::with_capacity(count);
            for _ in 0..count {
                let line = lines
                    .next()
                    .ok_or_else(|| DumpError::Malformed(format!("truncated '{name}'")))?;
                vals.push(
                    line.trim()
                        .parse::<E>()
                        .map_err(|_| DumpError::Malformed(format!("bad value in '{name}'")))?,
                );
            }
            Ok(vals)
        }

        let num_variables = header(lines.next(), "num_variables")?[0];
        let num_constraints = header(lines.next(), "num_constraints")?[0];

        let mut vector = |name: &str, len: I| -> Result<Col<E>, Problem> {
            let sizes = header(lines.next(), name)?;
            if sizes != vec![len] {
                return Err(DumpError::Malformed(format!("bad length for '{name}'")))?;
            }
            let vals = values(&mut lines, len, name)?;
            Ok(Col::from_fn(len, |i| vals[i]))
        };

        let linear_objective = vector("g", num_variables)?;
        let lower_variable_bounds = vector("lb", num_variables)?;
        let upper_variable_bounds = vector("ub", num_variables)?;
        let lower_constraint_bounds = vector("lbA", num_constraints)?;
        let upper_constraint_bounds = vector("ubA", num_constraints)?;

        let mut matrix = |name: &str, rows: I, cols: I| -> Result<Mat<E>, Problem> {
            let sizes = header(lines.next(), name)?;
            if sizes != vec![rows, cols] {
                return Err(DumpError::Malformed(format!("bad shape for '{name}'")))?;
            }
            let vals = values(&mut lines, rows * cols, name)?;
            Ok(Mat::from_fn(rows, cols, |i, j| vals[i * cols + j]))
        };

        let hessian = matrix("H_values", num_variables, num_variables)?;
        let jacobian = matrix("A_values", num_constraints, num_variables)?;

        Ok(Self {
            num_variables,
            num_constraints,
            linear_objective,
            lower_variable_bounds,
            upper_variable_bounds,
            lower_constraint_bounds,
            upper_constraint_bounds,
            hessian,
            jacobian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dump = QpDump {
            num_variables: 2,
            num_constraints: 1,
            linear_objective: Col::from_fn(2, |i| i as E - 0.5),
            lower_variable_bounds: Col::from_fn(2, |_| -1.),
            upper_variable_bounds: Col::from_fn(2, |_| 1.),
            lower_constraint_bounds: Col::from_fn(1, |_| 0.),
            upper_constraint_bounds: Col::from_fn(1, |_| 2.),
            hessian: Mat::from_fn(2, 2, |i, j| if i == j { 2. } else { 0.5 }),
            jacobian: Mat::from_fn(1, 2, |_, j| j as E + 1.),
        };

        let file = tempfile::NamedTempFile::new().unwrap();
        dump.write_to_file(file.path()).unwrap();
        let read = QpDump::read_from_file(file.path()).unwrap();

        assert_eq!(read.num_variables, 2);
        assert_eq!(read.num_constraints, 1);
        assert_eq!(read.linear_objective, dump.linear_objective);
        assert_eq!(read.hessian, dump.hessian);
        assert_eq!(read.jacobian, dump.jacobian);
    }

    #[test]
    fn test_malformed_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "not a qp dump\n").unwrap();
        assert!(QpDump::read_from_file(file.path()).is_err());
    }
}
