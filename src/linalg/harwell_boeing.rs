//! Compressed sparse (Harwell–Boeing) matrices for the QP back-end.
//!
//! The constraint matrix of the ℓ₁-penalty subproblem has the block shape
//! `[J | I | -I]` (plus further identity blocks in the slack formulation).
//! The structure is laid out exactly once, from the Jacobian's triplet
//! structure plus an [`IdentityMatrixPositions`] descriptor; afterwards only
//! values are overwritten, so identity entries never need re-indexing.

use derive_more::{Display, Error};
use faer::Mat;
use problemo::Problem;

use crate::{E, I};

#[derive(Debug, Display, Error, PartialEq)]
pub enum HarwellBoeingError {
    #[display("Entry ({_0}, {_1}) lies outside the declared dimensions")]
    IndexOutOfRange(I, I),

    #[display("Structure arrays have inconsistent lengths")]
    InconsistentStructure,
}

/// Storage orientation of a compressed sparse matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOrientation {
    /// Compressed sparse row.
    RowCompressed,
    /// Compressed sparse column.
    ColumnCompressed,
}

#[derive(Debug, Clone, Copy)]
struct IdentityBlock {
    row_offset: I,
    col_offset: I,
    size: I,
    sign: E,
}

/// Positions of the identity blocks embedded in the QP constraint matrix.
///
/// Offsets are zero-based.
#[derive(Debug, Clone, Default)]
pub struct IdentityMatrixPositions {
    blocks: Vec<IdentityBlock>,
}

impl IdentityMatrixPositions {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Registers an identity block of dimension `size` whose (0,0) entry
    /// sits at `(row_offset, col_offset)`, scaled by `sign`.
    pub fn add_matrix(&mut self, row_offset: I, col_offset: I, size: I, sign: E) {
        self.blocks.push(IdentityBlock {
            row_offset,
            col_offset,
            size,
            sign,
        });
    }

    pub fn num_blocks(&self) -> I {
        self.blocks.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum EntrySource {
    Triplet(I),
    Identity(E),
}

/// Compressed sparse matrix with embedded identity blocks.
#[derive(Debug, Clone)]
pub struct HarwellBoeingMatrix {
    orientation: StorageOrientation,
    num_rows: I,
    num_cols: I,
    /// Length `num_rows + 1` (row-compressed) or `num_cols + 1`.
    start_ptrs: Vec<I>,
    /// Column indices (row-compressed) or row indices, monotone within each
    /// major slice.
    indices: Vec<I>,
    values: Vec<E>,
    /// Slot of each triplet entry in `values`.
    triplet_map: Vec<I>,
    /// Slots and signs of the identity entries.
    identity_slots: Vec<(I, E)>,
}

impl HarwellBoeingMatrix {
    /// Lays out the structure from the Jacobian triplet structure plus the
    /// identity-block descriptor.  Values start at zero; call
    /// [`HarwellBoeingMatrix::update_values`] to fill them in.
    pub fn from_structure(
        orientation: StorageOrientation,
        num_rows: I,
        num_cols: I,
        triplet_rows: &[I],
        triplet_cols: &[I],
        identity_positions: &IdentityMatrixPositions,
    ) -> Result<Self, Problem> {
        if triplet_rows.len() != triplet_cols.len() {
            return Err(HarwellBoeingError::InconsistentStructure)?;
        }

        let mut entries: Vec<(I, I, EntrySource)> =
            Vec::with_capacity(triplet_rows.len() + identity_positions.blocks.len());
        for (k, (&row, &col)) in triplet_rows.iter().zip(triplet_cols.iter()).enumerate() {
            if row >= num_rows || col >= num_cols {
                return Err(HarwellBoeingError::IndexOutOfRange(row, col))?;
            }
            entries.push((row, col, EntrySource::Triplet(k)));
        }
        for block in &identity_positions.blocks {
            for j in 0..block.size {
                let row = block.row_offset + j;
                let col = block.col_offset + j;
                if row >= num_rows || col >= num_cols {
                    return Err(HarwellBoeingError::IndexOutOfRange(row, col))?;
                }
                entries.push((row, col, EntrySource::Identity(block.sign)));
            }
        }

        match orientation {
            StorageOrientation::RowCompressed => entries.sort_by_key(|&(row, col, _)| (row, col)),
            StorageOrientation::ColumnCompressed => {
                entries.sort_by_key(|&(row, col, _)| (col, row))
            }
        }

        let num_major = match orientation {
            StorageOrientation::RowCompressed => num_rows,
            StorageOrientation::ColumnCompressed => num_cols,
        };

        let mut start_ptrs = vec![0; num_major + 1];
        let mut indices = Vec::with_capacity(entries.len());
        let mut triplet_map = vec![0; triplet_rows.len()];
        let mut identity_slots = Vec::new();

        let mut last: Option<(I, I)> = None;
        for &(row, col, source) in &entries {
            let (major, minor) = match orientation {
                StorageOrientation::RowCompressed => (row, col),
                StorageOrientation::ColumnCompressed => (col, row),
            };
            // Coinciding entries share one slot and accumulate.
            if last != Some((major, minor)) {
                indices.push(minor);
                start_ptrs[major + 1] += 1;
                last = Some((major, minor));
            }
            let slot = indices.len() - 1;
            match source {
                EntrySource::Triplet(k) => triplet_map[k] = slot,
                EntrySource::Identity(sign) => identity_slots.push((slot, sign)),
            }
        }
        for major in 0..num_major {
            start_ptrs[major + 1] += start_ptrs[major];
        }

        let mut retval = Self {
            orientation,
            num_rows,
            num_cols,
            start_ptrs,
            values: vec![0.; indices.len()],
            indices,
            triplet_map,
            identity_slots,
        };
        retval.update_values(&vec![0.; triplet_rows.len()]);
        Ok(retval)
    }

    /// Overwrites the values from the Jacobian triplet values.  Identity
    /// entries are restored from the descriptor recorded at construction.
    pub fn update_values(&mut self, triplet_values: &[E]) {
        debug_assert_eq!(triplet_values.len(), self.triplet_map.len());
        self.values.fill(0.);
        for &(slot, sign) in &self.identity_slots {
            self.values[slot] += sign;
        }
        for (&slot, &val) in self.triplet_map.iter().zip(triplet_values.iter()) {
            self.values[slot] += val;
        }
    }

    pub fn orientation(&self) -> StorageOrientation {
        self.orientation
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

    pub fn start_ptrs(&self) -> &[I] {
        &self.start_ptrs
    }

    pub fn indices(&self) -> &[I] {
        &self.indices
    }

    pub fn values(&self) -> &[E] {
        &self.values
    }

    /// Expands into a dense matrix in the back-end's element order.
    pub fn to_dense(&self) -> Mat<E> {
        let mut out = Mat::zeros(self.num_rows, self.num_cols);
        for major in 0..self.start_ptrs.len() - 1 {
            for slot in self.start_ptrs[major]..self.start_ptrs[major + 1] {
                let minor = self.indices[slot];
                let (row, col) = match self.orientation {
                    StorageOrientation::RowCompressed => (major, minor),
                    StorageOrientation::ColumnCompressed => (minor, major),
                };
                out[(row, col)] += self.values[slot];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // J = [[1, 2], [0, 3]] embedded as [J | I | -I] (2 x 6).
    fn build(orientation: StorageOrientation) -> HarwellBoeingMatrix {
        let mut identity = IdentityMatrixPositions::new();
        identity.add_matrix(0, 2, 2, 1.);
        identity.add_matrix(0, 4, 2, -1.);
        let mut mat = HarwellBoeingMatrix::from_structure(
            orientation,
            2,
            6,
            &[0, 0, 1],
            &[0, 1, 1],
            &identity,
        )
        .unwrap();
        mat.update_values(&[1., 2., 3.]);
        mat
    }

    #[test]
    fn test_identity_embedding() {
        for orientation in [
            StorageOrientation::RowCompressed,
            StorageOrientation::ColumnCompressed,
        ] {
            let mat = build(orientation);
            let dense = mat.to_dense();
            let expected = [
                [1., 2., 1., 0., -1., 0.],
                [0., 3., 0., 1., 0., -1.],
            ];
            for row in 0..2 {
                for col in 0..6 {
                    assert_eq!(dense[(row, col)], expected[row][col]);
                }
            }
        }
    }

    #[test]
    fn test_value_update_keeps_identity() {
        let mut mat = build(StorageOrientation::RowCompressed);
        mat.update_values(&[-4., 0., 5.]);
        let dense = mat.to_dense();
        assert_eq!(dense[(0, 0)], -4.);
        assert_eq!(dense[(1, 1)], 5.);
        assert_eq!(dense[(0, 2)], 1.);
        assert_eq!(dense[(1, 5)], -1.);
    }

    #[test]
    fn test_pointer_and_index_invariants() {
        let mat = build(StorageOrientation::RowCompressed);
        assert_eq!(mat.start_ptrs().len(), mat.num_rows() + 1);
        assert_eq!(*mat.start_ptrs().last().unwrap(), mat.num_entries());
        for major in 0..mat.num_rows() {
            let slice = &mat.indices()[mat.start_ptrs()[major]..mat.start_ptrs()[major + 1]];
            assert!(slice.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        let identity = IdentityMatrixPositions::new();
        assert!(
            HarwellBoeingMatrix::from_structure(
                StorageOrientation::RowCompressed,
                2,
                2,
                &[2],
                &[0],
                &identity,
            )
            .is_err()
        );
    }
}
