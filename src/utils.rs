use rand::Rng;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};

use crate::element::Element;

/// Naive product of two `n x n` row-major matrices.
///
/// Rows of the result are computed in parallel on the current Rayon pool. This
/// is the oracle the blocked product is checked against, so it deliberately
/// shares nothing with the block kernels.
///
/// # Panics
///
/// Panics if `a` or `b` does not hold exactly `n * n` elements.
pub fn reference_matmul<T: Element>(a: &[T], b: &[T], n: usize) -> Vec<T> {
    assert_eq!(a.len(), n * n, "left factor must be {}x{}", n, n);
    assert_eq!(b.len(), n * n, "right factor must be {}x{}", n, n);

    let mut c = vec![T::zero(); n * n];
    if n == 0 {
        return c;
    }
    c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        for (j, c_value) in c_row.iter_mut().enumerate() {
            let mut sum = T::zero();
            for p in 0..n {
                sum += a[i * n + p] * b[p * n + j];
            }
            *c_value = sum;
        }
    });
    c
}

/// An `n x n` row-major matrix of values drawn uniformly from `0..10`.
pub fn random_matrix<T: Element, R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<T> {
    (0..n * n)
        .map(|_| T::from_u32(rng.random_range(0..10u32)).unwrap_or_else(T::zero))
        .collect()
}

/// Renders a row-major matrix with one line per row.
pub fn format_matrix<T: Element>(values: &[T], n_rows: usize, n_cols: usize) -> String {
    let mut out = String::new();
    for row in values.chunks(n_cols.max(1)).take(n_rows) {
        for value in row {
            out.push_str(&format!(" {:>5}", value));
        }
        out.push('\n');
    }
    out
}
