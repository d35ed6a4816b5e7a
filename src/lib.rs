//! Blocked dense matrix multiplication scheduled as a task graph.
//!
//! The operands are split into square blocks held in a [`BlockStore`]. One
//! multiply-accumulate task is submitted per block triple `(i, j, k)`, each
//! declaring the blocks it reads and the accumulator block it updates. The
//! [`TaskGraph`] turns those declarations into ordering edges, and the
//! [`executor`] runs the graph on a Rayon pool, starting every task as soon as
//! its predecessors are done.
//!
//! Kernels run on an [`ExecutionTarget`]. [`HostTarget`] works on the host
//! blocks directly; [`DeviceTarget`] simulates an accelerator with its own
//! memory, where blocks must be staged in before use and staged out afterwards,
//! either around every task ([`StagingStrategy::Inline`]) or once for the whole
//! product ([`StagingStrategy::Bulk`]).
//!
//! ```
//! use blockgemm::{block_matmul, BlockStore, Config, HostTarget};
//!
//! let a = BlockStore::from_flat(1, 1, 2, 2, &[1i64, 2, 3, 4]).unwrap();
//! let b = BlockStore::from_flat(1, 1, 2, 2, &[5i64, 6, 7, 8]).unwrap();
//! let mut c = BlockStore::square(1, 2).unwrap();
//!
//! block_matmul(&a, &b, &mut c, &HostTarget, &Config::default()).unwrap();
//! assert_eq!(c.to_flat(), vec![19, 22, 43, 50]);
//! ```

pub mod config;
pub mod element;
pub mod error;
pub mod executor;
pub mod graph;
pub mod kernel;
pub mod matmul;
pub mod store;
pub mod target;
pub mod utils;

pub use config::Config;
pub use element::Element;
pub use error::{BlockGemmError, Result};
pub use executor::ExecutionStats;
pub use graph::{BlockId, BlockTask, MatrixRole, TaskGraph, TaskKind};
pub use kernel::KernelMode;
pub use matmul::{block_matmul, build_graph, BlockMatMul, StagingStrategy};
pub use store::BlockStore;
pub use target::{DeviceTarget, ExecutionTarget, HostTarget, TransferStats};
