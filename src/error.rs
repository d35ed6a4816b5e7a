//! Error types for blocked matrix multiplication.
//!
//! Every failure the scheduler can observe at run time is reported through
//! [`BlockGemmError`]. Out-of-range block coordinates are programmer errors
//! and panic instead, and value mismatches are counts, not errors.

use std::fmt;

use crate::graph::BlockId;

/// Errors that can occur while building or running a blocked product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockGemmError {
    /// Block dimensions do not partition the matrix dimensions.
    DimensionError {
        /// Matrix rows requested.
        n_rows: usize,
        /// Matrix columns requested.
        n_cols: usize,
        /// Rows per block requested.
        rows_per_block: usize,
        /// Columns per block requested.
        cols_per_block: usize,
        /// Human-readable error message.
        message: String,
    },
    /// Input validation error.
    ValidationError {
        /// Human-readable error message.
        message: String,
    },
    /// A task found one of its blocks already borrowed by another task.
    AccessConflict {
        /// The contended block.
        block: BlockId,
        /// Human-readable error message.
        message: String,
    },
    /// A device operation referenced a block that is not resident.
    StagingError {
        /// The block being staged or used.
        block: BlockId,
        /// Human-readable error message.
        message: String,
    },
    /// Execution of a task failed on its target.
    TaskFailed {
        /// Description of the failed task.
        task: String,
        /// Human-readable error message.
        message: String,
    },
    /// The worker pool could not be created.
    ThreadPoolError {
        /// Human-readable error message.
        message: String,
    },
}

impl fmt::Display for BlockGemmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockGemmError::DimensionError {
                n_rows,
                n_cols,
                rows_per_block,
                cols_per_block,
                message,
            } => write!(
                f,
                "Invalid dimensions: {} (matrix {}x{}, block {}x{})",
                message, n_rows, n_cols, rows_per_block, cols_per_block
            ),
            BlockGemmError::ValidationError { message } => {
                write!(f, "Validation error: {}", message)
            }
            BlockGemmError::AccessConflict { block, message } => {
                write!(f, "Access conflict on block {}: {}", block, message)
            }
            BlockGemmError::StagingError { block, message } => {
                write!(f, "Staging error on block {}: {}", block, message)
            }
            BlockGemmError::TaskFailed { task, message } => {
                write!(f, "Task {} failed: {}", task, message)
            }
            BlockGemmError::ThreadPoolError { message } => {
                write!(f, "Thread pool error: {}", message)
            }
        }
    }
}

impl std::error::Error for BlockGemmError {}

/// Result type alias for blockgemm operations.
pub type Result<T> = std::result::Result<T, BlockGemmError>;

/// Creates a dimension error.
pub fn dimension_error(
    n_rows: usize,
    n_cols: usize,
    rows_per_block: usize,
    cols_per_block: usize,
    message: impl Into<String>,
) -> BlockGemmError {
    BlockGemmError::DimensionError {
        n_rows,
        n_cols,
        rows_per_block,
        cols_per_block,
        message: message.into(),
    }
}

/// Creates a validation error.
pub fn validation_error(message: impl Into<String>) -> BlockGemmError {
    BlockGemmError::ValidationError {
        message: message.into(),
    }
}

/// Creates an access conflict error.
pub fn access_conflict(block: BlockId, message: impl Into<String>) -> BlockGemmError {
    BlockGemmError::AccessConflict {
        block,
        message: message.into(),
    }
}

/// Creates a staging error.
pub fn staging_error(block: BlockId, message: impl Into<String>) -> BlockGemmError {
    BlockGemmError::StagingError {
        block,
        message: message.into(),
    }
}

/// Creates a task failure.
pub fn task_failed(task: impl Into<String>, message: impl Into<String>) -> BlockGemmError {
    BlockGemmError::TaskFailed {
        task: task.into(),
        message: message.into(),
    }
}

/// Creates a thread pool error.
pub fn thread_pool_error(message: impl Into<String>) -> BlockGemmError {
    BlockGemmError::ThreadPoolError {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MatrixRole;

    #[test]
    fn test_dimension_error_display() {
        let error = dimension_error(10, 10, 3, 3, "block size must divide matrix size");
        let display = format!("{}", error);
        assert!(display.contains("Invalid dimensions"));
        assert!(display.contains("matrix 10x10"));
        assert!(display.contains("block 3x3"));
        assert!(display.contains("block size must divide matrix size"));
    }

    #[test]
    fn test_validation_error_display() {
        let error = validation_error("source has 15 elements, expected 16");
        let display = format!("{}", error);
        assert!(display.contains("Validation error"));
        assert!(display.contains("expected 16"));
    }

    #[test]
    fn test_block_errors_name_the_block() {
        let block = BlockId::new(MatrixRole::C, 1, 2);
        let conflict = format!("{}", access_conflict(block, "already borrowed"));
        assert!(conflict.contains("C(1,2)"));
        assert!(conflict.contains("already borrowed"));

        let staging = format!("{}", staging_error(block, "not resident"));
        assert!(staging.contains("Staging error"));
        assert!(staging.contains("C(1,2)"));
    }

    #[test]
    fn test_error_equality() {
        let error1 = validation_error("test");
        let error2 = validation_error("test");
        let error3 = thread_pool_error("test");

        assert_eq!(error1, error2);
        assert_ne!(error1, error3);
    }

    #[test]
    fn test_error_trait_implementation() {
        let error = task_failed("C(0,0) += A(0,0) x B(0,0)", "device lost");

        let _: &dyn std::error::Error = &error;
        assert!(std::error::Error::source(&error).is_none());
    }
}
