use std::fmt;
use std::str::FromStr;

use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};

use crate::element::Element;
use crate::error::{validation_error, BlockGemmError};

/// Accumulates the product of two square blocks into a third: `C += A * B`.
///
/// All three blocks are `bs x bs` in block-local row-major order. For every
/// output cell `(ii, jj)` the partial sum over the block-local reduction index
/// is formed first and then added to `C`.
///
/// # Arguments
///
/// * `a` - Left factor block.
/// * `b` - Right factor block.
/// * `c` - Accumulator block, updated in place.
/// * `bs` - Block edge length.
#[allow(clippy::needless_range_loop)]
pub fn accumulate<T: Element>(a: &[T], b: &[T], c: &mut [T], bs: usize) {
    debug_assert_eq!(a.len(), bs * bs);
    debug_assert_eq!(b.len(), bs * bs);
    debug_assert_eq!(c.len(), bs * bs);

    for ii in 0..bs {
        for jj in 0..bs {
            let mut sum = T::zero();
            for kk in 0..bs {
                sum += a[ii * bs + kk] * b[kk * bs + jj];
            }
            c[ii * bs + jj] += sum;
        }
    }
}

/// Same as [`accumulate`], with the output rows spread over the Rayon pool.
///
/// Output cells are independent within one call, so each row of `C` is an
/// independent chunk. Called from inside a scheduled task it shares that task's
/// pool.
pub fn par_accumulate<T: Element>(a: &[T], b: &[T], c: &mut [T], bs: usize) {
    debug_assert_eq!(a.len(), bs * bs);
    debug_assert_eq!(b.len(), bs * bs);
    debug_assert_eq!(c.len(), bs * bs);

    c.par_chunks_mut(bs).enumerate().for_each(|(ii, c_row)| {
        let a_row = &a[ii * bs..(ii + 1) * bs];
        for (jj, c_value) in c_row.iter_mut().enumerate() {
            let mut sum = T::zero();
            for (kk, &a_value) in a_row.iter().enumerate() {
                sum += a_value * b[kk * bs + jj];
            }
            *c_value += sum;
        }
    });
}

/// Which kernel body a multiply task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelMode {
    #[default]
    Serial,
    Parallel,
}

impl KernelMode {
    #[inline]
    pub fn run<T: Element>(self, a: &[T], b: &[T], c: &mut [T], bs: usize) {
        match self {
            KernelMode::Serial => accumulate(a, b, c, bs),
            KernelMode::Parallel => par_accumulate(a, b, c, bs),
        }
    }
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelMode::Serial => f.write_str("serial"),
            KernelMode::Parallel => f.write_str("parallel"),
        }
    }
}

impl FromStr for KernelMode {
    type Err = BlockGemmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(KernelMode::Serial),
            "parallel" => Ok(KernelMode::Parallel),
            other => Err(validation_error(format!(
                "unknown kernel mode '{}', expected 'serial' or 'parallel'",
                other
            ))),
        }
    }
}
