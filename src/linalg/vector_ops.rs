//! Componentwise vector kernels over [`faer::Col`].

use faer::{Col, ColRef, unzip, zip};

use crate::{E, I};

/// Sets all entries of `x` to zero.
pub fn set_to_zero(x: &mut Col<E>) {
    zip!(x.as_mut()).for_each(|unzip!(x)| *x = 0.);
}

/// Overwrites `out` with `alpha * a + beta * b`.
pub fn set_to_sum_of_vectors(out: &mut Col<E>, alpha: E, a: ColRef<'_, E>, beta: E, b: ColRef<'_, E>) {
    debug_assert_eq!(out.nrows(), a.nrows());
    debug_assert_eq!(out.nrows(), b.nrows());
    zip!(out.as_mut(), a, b).for_each(|unzip!(out, a, b)| *out = alpha * *a + beta * *b);
}

/// Adds `alpha * x` to `y`.
pub fn axpy(alpha: E, x: ColRef<'_, E>, y: &mut Col<E>) {
    debug_assert_eq!(x.nrows(), y.nrows());
    zip!(y.as_mut(), x).for_each(|unzip!(y, x)| *y += alpha * *x);
}

/// Multiplies every entry of `x` by `alpha`.
pub fn scale(x: &mut Col<E>, alpha: E) {
    zip!(x.as_mut()).for_each(|unzip!(x)| *x *= alpha);
}

/// Copies `src` into `dst[offset..offset + src.len()]`.
pub fn copy_into_subvector(dst: &mut Col<E>, offset: I, src: ColRef<'_, E>) {
    debug_assert!(offset + src.nrows() <= dst.nrows());
    for i in 0..src.nrows() {
        dst[offset + i] = src[i];
    }
}

/// Returns `src[offset..offset + len]` as a new vector.
pub fn subvector(src: ColRef<'_, E>, offset: I, len: I) -> Col<E> {
    debug_assert!(offset + len <= src.nrows());
    Col::from_fn(len, |i| src[offset + i])
}

/// Computes the inner product of `a` and `b`.
pub fn inner_product(a: ColRef<'_, E>, b: ColRef<'_, E>) -> E {
    debug_assert_eq!(a.nrows(), b.nrows());
    let mut dot = 0.;
    zip!(a, b).for_each(|unzip!(a, b)| dot += *a * *b);
    dot
}

/// Computes the 1-norm of `x`.
pub fn one_norm(x: ColRef<'_, E>) -> E {
    let mut norm = 0.;
    zip!(x).for_each(|unzip!(x)| norm += x.abs());
    norm
}

/// Computes the ∞-norm of `x`.
pub fn inf_norm(x: ColRef<'_, E>) -> E {
    let mut norm = 0.;
    zip!(x).for_each(|unzip!(x)| norm = E::max(norm, x.abs()));
    norm
}

/// Computes the 1-norm of `x[offset..offset + len]`.
pub fn subvector_one_norm(x: ColRef<'_, E>, offset: I, len: I) -> E {
    debug_assert!(offset + len <= x.nrows());
    let mut norm = 0.;
    for i in offset..offset + len {
        norm += x[i].abs();
    }
    norm
}

/// Projects every entry of `x` into the interval `[lower, upper]`.
pub fn clip_to_bounds(x: &mut Col<E>, lower: ColRef<'_, E>, upper: ColRef<'_, E>) {
    debug_assert_eq!(x.nrows(), lower.nrows());
    debug_assert_eq!(x.nrows(), upper.nrows());
    zip!(x.as_mut(), lower, upper).for_each(|unzip!(x, lower, upper)| {
        debug_assert!(*lower <= *upper);
        *x = x.max(*lower).min(*upper);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(data: &[E]) -> Col<E> {
        Col::from_fn(data.len(), |i| data[i])
    }

    #[test]
    fn test_sum_of_vectors_and_axpy() {
        let a = col(&[1., 2., 3.]);
        let b = col(&[4., 5., 6.]);
        let mut out = Col::zeros(3);
        set_to_sum_of_vectors(&mut out, 2., a.as_ref(), -1., b.as_ref());
        assert_eq!(out, col(&[-2., -1., 0.]));

        axpy(3., a.as_ref(), &mut out);
        assert_eq!(out, col(&[1., 5., 9.]));

        set_to_zero(&mut out);
        assert_eq!(out, Col::zeros(3));
    }

    #[test]
    fn test_norms_and_inner_product() {
        let x = col(&[1., -2., 3.]);
        let y = col(&[2., 0., -1.]);
        assert_eq!(one_norm(x.as_ref()), 6.);
        assert_eq!(inf_norm(x.as_ref()), 3.);
        assert_eq!(inner_product(x.as_ref(), y.as_ref()), -1.);
        assert_eq!(subvector_one_norm(x.as_ref(), 1, 2), 5.);
    }

    #[test]
    fn test_subvector_copies() {
        let src = col(&[1., 2.]);
        let mut dst = Col::zeros(4);
        copy_into_subvector(&mut dst, 1, src.as_ref());
        assert_eq!(dst, col(&[0., 1., 2., 0.]));
        assert_eq!(subvector(dst.as_ref(), 1, 2), src);
    }

    #[test]
    fn test_clip_to_bounds() {
        let mut x = col(&[-3., 0.5, 7.]);
        let lower = col(&[-1., -1., -1.]);
        let upper = col(&[1., 1., 1.]);
        clip_to_bounds(&mut x, lower.as_ref(), upper.as_ref());
        assert_eq!(x, col(&[-1., 0.5, 1.]));
    }
}
