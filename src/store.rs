//! Block storage for one operand matrix.
//!
//! A [`BlockStore`] partitions an `n_rows x n_cols` matrix into a grid of
//! `rows_per_block x cols_per_block` blocks, each its own contiguous buffer in
//! block-local row-major order. The store owns every buffer; callers only
//! borrow blocks by coordinate.
//!
//! ## Coordinates
//!
//! A block address `(x, y)` selects the block holding flat columns
//! `x * cols_per_block ..` and flat rows `y * rows_per_block ..`. The first
//! coordinate runs along the column axis of the flat matrix and the second along
//! the row axis. [`crate::graph::BlockTask`] pairs its factors with this
//! layout in mind, so a different layout would silently compute another
//! product.
//!
//! ## Borrowing
//!
//! Each buffer sits behind its own lock. Tasks use [`BlockStore::try_read`] and
//! [`BlockStore::try_write`], which never wait: contention is reported to the
//! caller because it can only mean two conflicting tasks were scheduled at the
//! same time.

use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use crate::element::Element;
use crate::error::{dimension_error, validation_error, Result};

pub struct BlockStore<T> {
    rows_per_block: usize,
    cols_per_block: usize,
    n_rows: usize,
    n_cols: usize,
    grid_cols: usize,
    grid_rows: usize,
    blocks: Vec<RwLock<Vec<T>>>,
}

impl<T: Element> BlockStore<T> {
    /// Allocates a zero-filled store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BlockGemmError::DimensionError`] if any dimension
    /// is zero or a block dimension does not divide its matrix dimension.
    pub fn new(
        rows_per_block: usize,
        cols_per_block: usize,
        n_rows: usize,
        n_cols: usize,
    ) -> Result<Self> {
        if rows_per_block == 0 || cols_per_block == 0 || n_rows == 0 || n_cols == 0 {
            return Err(dimension_error(
                n_rows,
                n_cols,
                rows_per_block,
                cols_per_block,
                "dimensions must be non-zero",
            ));
        }
        if n_rows % rows_per_block != 0 || n_cols % cols_per_block != 0 {
            return Err(dimension_error(
                n_rows,
                n_cols,
                rows_per_block,
                cols_per_block,
                "block dimensions must divide matrix dimensions",
            ));
        }

        let grid_cols = n_cols / cols_per_block;
        let grid_rows = n_rows / rows_per_block;
        let block_len = rows_per_block * cols_per_block;
        let blocks = (0..grid_cols * grid_rows)
            .map(|_| RwLock::new(vec![T::zero(); block_len]))
            .collect();

        Ok(BlockStore {
            rows_per_block,
            cols_per_block,
            n_rows,
            n_cols,
            grid_cols,
            grid_rows,
            blocks,
        })
    }

    /// An `n x n` store of `block_size x block_size` blocks.
    pub fn square(block_size: usize, n: usize) -> Result<Self> {
        Self::new(block_size, block_size, n, n)
    }

    /// Builds a store and fills it from a row-major flat matrix.
    pub fn from_flat(
        rows_per_block: usize,
        cols_per_block: usize,
        n_rows: usize,
        n_cols: usize,
        source: &[T],
    ) -> Result<Self> {
        let mut store = Self::new(rows_per_block, cols_per_block, n_rows, n_cols)?;
        store.initialize(source)?;
        Ok(store)
    }

    pub fn rows_per_block(&self) -> usize {
        self.rows_per_block
    }

    pub fn cols_per_block(&self) -> usize {
        self.cols_per_block
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Number of valid `x` coordinates.
    pub fn grid_cols(&self) -> usize {
        self.grid_cols
    }

    /// Number of valid `y` coordinates.
    pub fn grid_rows(&self) -> usize {
        self.grid_rows
    }

    pub fn block_len(&self) -> usize {
        self.rows_per_block * self.cols_per_block
    }

    #[inline]
    fn slot(&self, x: usize, y: usize) -> usize {
        assert!(
            x < self.grid_cols && y < self.grid_rows,
            "Accessing outside block: ({}, {}) in a {}x{} block grid",
            x,
            y,
            self.grid_cols,
            self.grid_rows
        );
        x * self.grid_rows + y
    }

    /// Borrows a block for reading, waiting for any writer.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is outside the block grid.
    pub fn block(&self, x: usize, y: usize) -> RwLockReadGuard<'_, Vec<T>> {
        let slot = self.slot(x, y);
        self.blocks[slot]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrows a block mutably through exclusive access to the store.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is outside the block grid.
    pub fn block_mut(&mut self, x: usize, y: usize) -> &mut [T] {
        let slot = self.slot(x, y);
        self.blocks[slot]
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrows a block for reading without waiting. `None` means a writer holds it.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is outside the block grid.
    pub fn try_read(&self, x: usize, y: usize) -> Option<RwLockReadGuard<'_, Vec<T>>> {
        let slot = self.slot(x, y);
        match self.blocks[slot].try_read() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Borrows a block for writing without waiting. `None` means it is borrowed elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is outside the block grid.
    pub fn try_write(&self, x: usize, y: usize) -> Option<RwLockWriteGuard<'_, Vec<T>>> {
        let slot = self.slot(x, y);
        match self.blocks[slot].try_write() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn check_len(&self, source: &[T]) -> Result<()> {
        let expected = self.n_rows * self.n_cols;
        if source.len() != expected {
            return Err(validation_error(format!(
                "flat matrix has {} elements, expected {} ({}x{})",
                source.len(),
                expected,
                self.n_rows,
                self.n_cols
            )));
        }
        Ok(())
    }

    /// Copies a row-major flat matrix into block layout.
    pub fn initialize(&mut self, source: &[T]) -> Result<()> {
        self.check_len(source)?;

        let (rpb, cpb, n_cols) = (self.rows_per_block, self.cols_per_block, self.n_cols);
        for x in 0..self.grid_cols {
            for y in 0..self.grid_rows {
                let block = self.block_mut(x, y);
                for local_row in 0..rpb {
                    let row = y * rpb + local_row;
                    let src = &source[row * n_cols + x * cpb..row * n_cols + (x + 1) * cpb];
                    block[local_row * cpb..(local_row + 1) * cpb].copy_from_slice(src);
                }
            }
        }
        Ok(())
    }

    /// Counts elements that differ from a row-major flat matrix.
    ///
    /// Uses [`Element::matches`], so integers compare exactly and floats within
    /// their machine epsilon. Neither side is modified.
    pub fn compare(&self, source: &[T]) -> Result<usize> {
        self.check_len(source)?;

        let (rpb, cpb, n_cols) = (self.rows_per_block, self.cols_per_block, self.n_cols);
        let mut mismatches = 0;
        for x in 0..self.grid_cols {
            for y in 0..self.grid_rows {
                let block = self.block(x, y);
                for local_row in 0..rpb {
                    let row = y * rpb + local_row;
                    for local_col in 0..cpb {
                        let col = x * cpb + local_col;
                        if !block[local_row * cpb + local_col].matches(source[row * n_cols + col])
                        {
                            mismatches += 1;
                        }
                    }
                }
            }
        }
        Ok(mismatches)
    }

    /// Flattens the store back into a row-major matrix.
    pub fn to_flat(&self) -> Vec<T> {
        let (rpb, cpb, n_cols) = (self.rows_per_block, self.cols_per_block, self.n_cols);
        let mut flat = vec![T::zero(); self.n_rows * n_cols];
        for x in 0..self.grid_cols {
            for y in 0..self.grid_rows {
                let block = self.block(x, y);
                for local_row in 0..rpb {
                    let row = y * rpb + local_row;
                    flat[row * n_cols + x * cpb..row * n_cols + (x + 1) * cpb]
                        .copy_from_slice(&block[local_row * cpb..(local_row + 1) * cpb]);
                }
            }
        }
        flat
    }
}

impl<T: Element> fmt::Display for BlockStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for x in 0..self.grid_cols {
            for y in 0..self.grid_rows {
                let block = self.block(x, y);
                writeln!(f, "Block ({}, {})", x, y)?;
                for row in block.chunks(self.cols_per_block) {
                    for value in row {
                        write!(f, " {:>5}", value)?;
                    }
                    writeln!(f)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl<T: Element> fmt::Debug for BlockStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("n_rows", &self.n_rows)
            .field("n_cols", &self.n_cols)
            .field("rows_per_block", &self.rows_per_block)
            .field("cols_per_block", &self.cols_per_block)
            .finish()
    }
}
