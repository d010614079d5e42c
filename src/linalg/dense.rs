//! Dense factorization seams used by the QP back-end.
//!
//! The active-set method repeatedly solves small symmetric systems (reduced
//! Hessians, Gram matrices of working-set normals).  All faer solver calls
//! are concentrated here.

use faer::prelude::*;
use faer::{Col, Mat, MatRef};

use crate::E;

/// Solves `mat * x = rhs` via a Cholesky factorization.  Returns `None` if
/// the matrix is not positive definite.
pub(crate) fn solve_llt(mat: MatRef<'_, E>, rhs: &Col<E>) -> Option<Col<E>> {
    debug_assert_eq!(mat.nrows(), mat.ncols());
    debug_assert_eq!(mat.nrows(), rhs.nrows());
    let llt = mat.llt(faer::Side::Lower).ok()?;
    let b = Mat::from_fn(rhs.nrows(), 1, |i, _| rhs[i]);
    let sol = llt.solve(&b);
    for i in 0..rhs.nrows() {
        if !sol[(i, 0)].is_finite() {
            return None;
        }
    }
    Some(Col::from_fn(rhs.nrows(), |i| sol[(i, 0)]))
}

/// Solves `mat * x = rhs` via an LU factorization with partial pivoting.
pub(crate) fn solve_lu(mat: MatRef<'_, E>, rhs: &Col<E>) -> Col<E> {
    debug_assert_eq!(mat.nrows(), mat.ncols());
    debug_assert_eq!(mat.nrows(), rhs.nrows());
    let lu = mat.partial_piv_lu();
    let b = Mat::from_fn(rhs.nrows(), 1, |i, _| rhs[i]);
    let sol = lu.solve(&b);
    Col::from_fn(rhs.nrows(), |i| sol[(i, 0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_llt_spd() {
        let mat = Mat::from_fn(2, 2, |i, j| if i == j { 2. } else { -1. });
        let rhs = Col::from_fn(2, |i| i as E + 1.);
        let x = solve_llt(mat.as_ref(), &rhs).unwrap();
        let residual = &mat * &x - &rhs;
        assert!(residual.norm_l2() < 1e-12);
    }

    #[test]
    fn test_solve_llt_rejects_indefinite() {
        let mut mat = Mat::zeros(2, 2);
        mat[(0, 0)] = 1.;
        mat[(1, 1)] = -1.;
        let rhs = Col::from_fn(2, |_| 1.);
        assert!(solve_llt(mat.as_ref(), &rhs).is_none());
    }

    #[test]
    fn test_solve_lu() {
        let mut mat = Mat::zeros(2, 2);
        mat[(0, 0)] = 0.;
        mat[(0, 1)] = 1.;
        mat[(1, 0)] = 2.;
        mat[(1, 1)] = 1.;
        let rhs = Col::from_fn(2, |i| if i == 0 { 3. } else { 4. });
        let x = solve_lu(mat.as_ref(), &rhs);
        let residual = &mat * &x - &rhs;
        assert!(residual.norm_l2() < 1e-12);
    }
}
