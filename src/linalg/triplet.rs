//! Coordinate-format sparse matrices.
//!
//! This is the format the NLP callbacks naturally produce: the structure
//! (row and column indices) is fixed once, values are overwritten in place.
//! Duplicate entries are permitted and act additively in all products.

use derive_more::{Display, Error};
use faer::{Col, ColRef};
use problemo::Problem;

use crate::{E, I};

#[derive(Debug, Display, Error, PartialEq)]
pub enum TripletError {
    #[display("Entry ({_0}, {_1}) lies outside the declared dimensions")]
    IndexOutOfRange(I, I),

    #[display("Structure arrays have inconsistent lengths")]
    InconsistentStructure,

    #[display("Entry ({_0}, {_1}) lies in the strict upper triangle of a symmetric matrix")]
    UpperTriangleEntry(I, I),
}

/// Sparse matrix in coordinate (triplet) format.
///
/// When `is_symmetric` is set, only the lower triangle is stored and
/// products implicitly mirror the off-diagonal entries.
#[derive(Debug, Clone)]
pub struct SparseTripletMatrix {
    num_rows: I,
    num_cols: I,
    row_indices: Vec<I>,
    col_indices: Vec<I>,
    values: Vec<E>,
    is_symmetric: bool,
}

impl SparseTripletMatrix {
    /// Creates a matrix with the given structure and zero values.
    pub fn new(
        num_rows: I,
        num_cols: I,
        row_indices: Vec<I>,
        col_indices: Vec<I>,
        is_symmetric: bool,
    ) -> Result<Self, Problem> {
        if row_indices.len() != col_indices.len() {
            return Err(TripletError::InconsistentStructure)?;
        }
        for (&row, &col) in row_indices.iter().zip(col_indices.iter()) {
            if row >= num_rows || col >= num_cols {
                return Err(TripletError::IndexOutOfRange(row, col))?;
            }
            if is_symmetric && col > row {
                return Err(TripletError::UpperTriangleEntry(row, col))?;
            }
        }
        let values = vec![0.; row_indices.len()];
        Ok(Self {
            num_rows,
            num_cols,
            row_indices,
            col_indices,
            values,
            is_symmetric,
        })
    }

    pub fn num_rows(&self) -> I {
        self.num_rows
    }

    pub fn num_cols(&self) -> I {
        self.num_cols
    }

    pub fn num_entries(&self) -> I {
        self.values.len()
    }

    pub fn is_symmetric(&self) -> bool {
        self.is_symmetric
    }

    pub fn row_indices(&self) -> &[I] {
        &self.row_indices
    }

    pub fn col_indices(&self) -> &[I] {
        &self.col_indices
    }

    pub fn values(&self) -> &[E] {
        &self.values
    }

    /// Overwrites the values in place.  The structure is unchanged.
    pub fn set_values(&mut self, values: &[E]) {
        debug_assert_eq!(values.len(), self.values.len());
        self.values.copy_from_slice(values);
    }

    pub fn values_mut(&mut self) -> &mut [E] {
        &mut self.values
    }

    /// Accumulates `out += A x` (mirroring the off-diagonal entries when the
    /// matrix is symmetric).
    pub fn multiply(&self, x: ColRef<'_, E>, out: &mut Col<E>) {
        debug_assert_eq!(x.nrows(), self.num_cols);
        debug_assert_eq!(out.nrows(), self.num_rows);
        for ((&row, &col), &val) in self
            .row_indices
            .iter()
            .zip(self.col_indices.iter())
            .zip(self.values.iter())
        {
            out[row] += val * x[col];
            if self.is_symmetric && row != col {
                out[col] += val * x[row];
            }
        }
    }

    /// Accumulates `out += factor * Aᵀ x`.
    pub fn multiply_transpose(&self, x: ColRef<'_, E>, out: &mut Col<E>, factor: E) {
        debug_assert_eq!(x.nrows(), self.num_rows);
        debug_assert_eq!(out.nrows(), self.num_cols);
        for ((&row, &col), &val) in self
            .row_indices
            .iter()
            .zip(self.col_indices.iter())
            .zip(self.values.iter())
        {
            out[col] += factor * val * x[row];
            if self.is_symmetric && row != col {
                out[row] += factor * val * x[col];
            }
        }
    }

    /// Computes the 1-norm (maximum absolute column sum).
    pub fn one_norm(&self) -> E {
        let mut col_sums = vec![0.; self.num_cols];
        self.for_each_expanded(|row, col, val| {
            col_sums[col] += val.abs();
            let _ = row;
        });
        col_sums.iter().cloned().fold(0., E::max)
    }

    /// Computes the ∞-norm (maximum absolute row sum).
    pub fn inf_norm(&self) -> E {
        let mut row_sums = vec![0.; self.num_rows];
        self.for_each_expanded(|row, col, val| {
            row_sums[row] += val.abs();
            let _ = col;
        });
        row_sums.iter().cloned().fold(0., E::max)
    }

    /// Visits every structural entry, mirroring symmetric off-diagonals.
    pub fn for_each_expanded(&self, mut visit: impl FnMut(I, I, E)) {
        for ((&row, &col), &val) in self
            .row_indices
            .iter()
            .zip(self.col_indices.iter())
            .zip(self.values.iter())
        {
            visit(row, col, val);
            if self.is_symmetric && row != col {
                visit(col, row, val);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(data: &[E]) -> Col<E> {
        Col::from_fn(data.len(), |i| data[i])
    }

    #[test]
    fn test_structure_validation() {
        assert!(SparseTripletMatrix::new(2, 2, vec![0, 2], vec![0, 0], false).is_err());
        assert!(SparseTripletMatrix::new(2, 2, vec![0], vec![0, 1], false).is_err());
        assert!(SparseTripletMatrix::new(2, 2, vec![0], vec![1], true).is_err());
        assert!(SparseTripletMatrix::new(2, 2, vec![0, 1], vec![0, 0], true).is_ok());
    }

    #[test]
    fn test_multiply_with_duplicates() {
        // [[1+2, 0], [0, 3]] stored with a duplicate at (0,0)
        let mut mat =
            SparseTripletMatrix::new(2, 2, vec![0, 0, 1], vec![0, 0, 1], false).unwrap();
        mat.set_values(&[1., 2., 3.]);

        let x = col(&[1., 1.]);
        let mut out = Col::zeros(2);
        mat.multiply(x.as_ref(), &mut out);
        assert_eq!(out, col(&[3., 3.]));

        let mut out_t = Col::zeros(2);
        mat.multiply_transpose(x.as_ref(), &mut out_t, -1.);
        assert_eq!(out_t, col(&[-3., -3.]));
    }

    #[test]
    fn test_symmetric_multiply() {
        // [[2, 1], [1, 4]] stored as lower triangle
        let mut mat = SparseTripletMatrix::new(2, 2, vec![0, 1, 1], vec![0, 0, 1], true).unwrap();
        mat.set_values(&[2., 1., 4.]);

        let x = col(&[1., 2.]);
        let mut out = Col::zeros(2);
        mat.multiply(x.as_ref(), &mut out);
        assert_eq!(out, col(&[4., 9.]));
    }

    #[test]
    fn test_norms() {
        // [[1, -2], [0, 3]]
        let mut mat = SparseTripletMatrix::new(2, 2, vec![0, 0, 1], vec![0, 1, 1], false).unwrap();
        mat.set_values(&[1., -2., 3.]);
        assert_eq!(mat.one_norm(), 5.);
        assert_eq!(mat.inf_norm(), 3.);
    }
}
