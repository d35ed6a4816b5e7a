use std::fmt;
use std::str::FromStr;

use rayon::ThreadPool;

use crate::config::Config;
use crate::element::Element;
use crate::error::{validation_error, BlockGemmError, Result};
use crate::executor::{execute, ExecutionStats};
use crate::graph::{BlockId, BlockTask, MatrixRole, TaskGraph, TaskKind};
use crate::kernel::KernelMode;
use crate::store::BlockStore;
use crate::target::{ExecutionTarget, HostMemory};

/// When block data is moved to and from the execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagingStrategy {
    /// Every multiply task stages its own three blocks in, runs, stages its
    /// accumulator out and releases its factors. Simple, but the same block is
    /// transferred again for every `k`.
    Inline,
    /// Stage every block of A, B and C in, run all multiplies against resident
    /// data, then release A and B and stage C out. One transfer per block.
    #[default]
    Bulk,
}

impl fmt::Display for StagingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagingStrategy::Inline => f.write_str("inline"),
            StagingStrategy::Bulk => f.write_str("bulk"),
        }
    }
}

impl FromStr for StagingStrategy {
    type Err = BlockGemmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(StagingStrategy::Inline),
            "bulk" => Ok(StagingStrategy::Bulk),
            other => Err(validation_error(format!(
                "unknown staging strategy '{}', expected 'inline' or 'bulk'",
                other
            ))),
        }
    }
}

/// Builds the task graph of a blocked product over an `n_blocks x n_blocks` grid.
///
/// Multiply tasks are submitted for `i` (outer), `j` (middle), `k` (inner), one
/// per block triple. With [`StagingStrategy::Bulk`] they are preceded by a
/// stage-in of every block of A, B and C, and followed by a release of every
/// block of A and B and a stage-out of every block of C. The graph derives all
/// ordering from those declarations:
///
/// * multiplies into the same `C(i,j)` run one at a time, in `k` order;
/// * a multiply waits for the stage-ins of its three blocks;
/// * a release or stage-out waits for every multiply touching its block.
pub fn build_graph(n_blocks: usize, strategy: StagingStrategy) -> TaskGraph {
    let mut graph = TaskGraph::new();
    let bulk = strategy == StagingStrategy::Bulk;

    if bulk {
        for x in 0..n_blocks {
            for y in 0..n_blocks {
                for role in [MatrixRole::A, MatrixRole::B, MatrixRole::C] {
                    graph.submit(TaskKind::StageIn(BlockId::new(role, x, y)));
                }
            }
        }
    }

    for i in 0..n_blocks {
        for j in 0..n_blocks {
            for k in 0..n_blocks {
                graph.submit(TaskKind::Multiply {
                    task: BlockTask::new(i, j, k),
                    inline: !bulk,
                });
            }
        }
    }

    if bulk {
        for x in 0..n_blocks {
            for y in 0..n_blocks {
                graph.submit(TaskKind::Release(BlockId::new(MatrixRole::A, x, y)));
                graph.submit(TaskKind::Release(BlockId::new(MatrixRole::B, x, y)));
                graph.submit(TaskKind::StageOut(BlockId::new(MatrixRole::C, x, y)));
            }
        }
    }

    log::debug!(
        "built {} graph for {}x{} blocks: {} tasks, {} edges",
        strategy,
        n_blocks,
        n_blocks,
        graph.len(),
        graph.edge_count()
    );
    graph
}

/// A blocked product `C += A * B` over three square block stores.
///
/// Holding a `BlockMatMul` keeps `C` exclusively borrowed, so nothing else can
/// observe the accumulator while tasks are writing it.
pub struct BlockMatMul<'a, T> {
    a: &'a BlockStore<T>,
    b: &'a BlockStore<T>,
    c: &'a BlockStore<T>,
    block_size: usize,
    n_blocks: usize,
}

impl<'a, T: Element> BlockMatMul<'a, T> {
    /// # Errors
    ///
    /// Returns a validation error unless all three stores are square, with
    /// square blocks, and share their dimensions.
    pub fn new(
        a: &'a BlockStore<T>,
        b: &'a BlockStore<T>,
        c: &'a mut BlockStore<T>,
    ) -> Result<Self> {
        let c: &'a BlockStore<T> = c;
        for (role, store) in [(MatrixRole::A, a), (MatrixRole::B, b), (MatrixRole::C, c)] {
            if store.n_rows() != store.n_cols() || store.rows_per_block() != store.cols_per_block()
            {
                return Err(validation_error(format!(
                    "matrix {} must be square with square blocks, got {}x{} in {}x{} blocks",
                    role,
                    store.n_rows(),
                    store.n_cols(),
                    store.rows_per_block(),
                    store.cols_per_block()
                )));
            }
            if store.n_rows() != c.n_rows() || store.rows_per_block() != c.rows_per_block() {
                return Err(validation_error(format!(
                    "matrix {} is {}x{} in blocks of {}, but C is {}x{} in blocks of {}",
                    role,
                    store.n_rows(),
                    store.n_cols(),
                    store.rows_per_block(),
                    c.n_rows(),
                    c.n_cols(),
                    c.rows_per_block()
                )));
            }
        }

        Ok(BlockMatMul {
            a,
            b,
            c,
            block_size: c.rows_per_block(),
            n_blocks: c.grid_rows(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks along each edge of the grid.
    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    pub fn graph(&self, strategy: StagingStrategy) -> TaskGraph {
        build_graph(self.n_blocks, strategy)
    }

    /// Builds the graph and a worker pool from `config` and runs to completion.
    pub fn run(
        &self,
        target: &dyn ExecutionTarget<T>,
        config: &Config,
    ) -> Result<ExecutionStats> {
        log::info!(
            "blocked product: n={} bs={} strategy={} target={} kernel={}",
            self.c.n_rows(),
            self.block_size,
            config.strategy,
            target.name(),
            config.kernel
        );
        let graph = self.graph(config.strategy);
        let pool = config.build_pool()?;
        let stats = self.run_graph(&graph, target, &pool, config.kernel)?;
        log::info!("blocked product done: {} tasks", stats.tasks_executed);
        Ok(stats)
    }

    /// Runs an already built graph on the given pool.
    ///
    /// # Errors
    ///
    /// Any task failure is fatal. The first error is returned, and the contents
    /// of `C` are then undefined.
    pub fn run_graph(
        &self,
        graph: &TaskGraph,
        target: &dyn ExecutionTarget<T>,
        pool: &ThreadPool,
        kernel: KernelMode,
    ) -> Result<ExecutionStats> {
        let host = HostMemory::new(self.a, self.b, self.c);

        execute(graph, pool, |node| match *node.kind() {
            TaskKind::StageIn(block) => target.stage_in(block, &host.read(block)?),
            TaskKind::StageOut(block) => target.stage_out(block, &mut host.write(block)?),
            TaskKind::Release(block) => target.release(block),
            TaskKind::Multiply {
                task,
                inline: false,
            } => target.launch(&task, &host, kernel),
            TaskKind::Multiply { task, inline: true } => {
                run_inline(target, &host, &task, kernel)
            }
        })
    }
}

fn run_inline<T: Element>(
    target: &dyn ExecutionTarget<T>,
    host: &HostMemory<'_, T>,
    task: &BlockTask,
    kernel: KernelMode,
) -> Result<()> {
    for block in [task.a(), task.b(), task.c()] {
        target.stage_in(block, &host.read(block)?)?;
    }
    target.launch(task, host, kernel)?;
    target.stage_out(task.c(), &mut host.write(task.c())?)?;
    target.release(task.a())?;
    target.release(task.b())
}

/// Computes `C += A * B` block by block on `target`.
///
/// `c` is normally zero-filled by the caller. On success it holds the product;
/// on error its contents are undefined.
pub fn block_matmul<T: Element>(
    a: &BlockStore<T>,
    b: &BlockStore<T>,
    c: &mut BlockStore<T>,
    target: &dyn ExecutionTarget<T>,
    config: &Config,
) -> Result<ExecutionStats> {
    BlockMatMul::new(a, b, c)?.run(target, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{DeviceTarget, HostTarget};

    // Row-major reference product.
    fn naive_matmul(a: &[i64], b: &[i64], n: usize) -> Vec<i64> {
        let mut c = vec![0; n * n];
        for i in 0..n {
            for p in 0..n {
                for j in 0..n {
                    c[i * n + j] += a[i * n + p] * b[p * n + j];
                }
            }
        }
        c
    }

    fn run_blocked(
        a: &[i64],
        b: &[i64],
        n: usize,
        bs: usize,
        target: &dyn ExecutionTarget<i64>,
        config: &Config,
    ) -> BlockStore<i64> {
        let a = BlockStore::from_flat(bs, bs, n, n, a).unwrap();
        let b = BlockStore::from_flat(bs, bs, n, n, b).unwrap();
        let mut c = BlockStore::square(bs, n).unwrap();
        block_matmul(&a, &b, &mut c, target, config).unwrap();
        c
    }

    #[test]
    fn test_graph_sizes() {
        let inline = build_graph(3, StagingStrategy::Inline);
        assert_eq!(inline.len(), 27);

        let bulk = build_graph(3, StagingStrategy::Bulk);
        assert_eq!(bulk.len(), 27 + 6 * 9);
        assert_eq!(bulk.roots().len(), 27);
    }

    #[test]
    fn test_bulk_multiply_waits_for_its_stage_ins() {
        let graph = build_graph(2, StagingStrategy::Bulk);
        for node in graph.iter() {
            if let TaskKind::Multiply { task, .. } = node.kind() {
                let staged: Vec<_> = node
                    .predecessors()
                    .iter()
                    .filter_map(|&p| match graph.node(p).kind() {
                        TaskKind::StageIn(block) => Some(*block),
                        _ => None,
                    })
                    .collect();
                let expected_stage_ins = if task.k == 0 { 3 } else { 2 };
                assert_eq!(staged.len(), expected_stage_ins, "{}", task);
                assert!(staged.contains(&task.a()));
                assert!(staged.contains(&task.b()));
            }
        }
    }

    #[test]
    fn test_bulk_stage_out_waits_for_all_multiplies() {
        let n_blocks = 3;
        let graph = build_graph(n_blocks, StagingStrategy::Bulk);
        for node in graph.iter() {
            let block = match node.kind() {
                TaskKind::StageOut(block) | TaskKind::Release(block) => *block,
                _ => continue,
            };
            for other in graph.iter() {
                if let TaskKind::Multiply { task, .. } = other.kind() {
                    if [task.a(), task.b(), task.c()].contains(&block) {
                        assert!(graph.has_path(other.id(), node.id()), "{} -> {}", task, block);
                    }
                }
            }
        }
    }

    #[test]
    fn test_quadrant_product() {
        #[rustfmt::skip]
        let a = [
            1, 2, 0, 0,
            3, 4, 0, 0,
            0, 0, 0, 0,
            0, 0, 0, 0,
        ];
        #[rustfmt::skip]
        let b = [
            5, 6, 0, 0,
            7, 8, 0, 0,
            0, 0, 0, 0,
            0, 0, 0, 0,
        ];
        for strategy in [StagingStrategy::Inline, StagingStrategy::Bulk] {
            let config = Config::new().with_strategy(strategy).with_threads(2);
            let c = run_blocked(&a, &b, 4, 2, &HostTarget, &config);
            assert_eq!(*c.block(0, 0), vec![19, 22, 43, 50], "{}", strategy);
            assert_eq!(c.compare(&naive_matmul(&a, &b, 4)).unwrap(), 0);
        }
    }

    #[test]
    fn test_non_symmetric_inputs_match_reference() {
        let n = 6;
        let a: Vec<i64> = (0..(n * n) as i64).map(|x| (x * 7) % 10).collect();
        let b: Vec<i64> = (0..(n * n) as i64).map(|x| (x * 3 + 1) % 10).collect();
        let expected = naive_matmul(&a, &b, n);

        for bs in [1, 2, 3, 6] {
            let device = DeviceTarget::<i64>::new();
            let config = Config::new().with_threads(3);
            let c = run_blocked(&a, &b, n, bs, &device, &config);
            assert_eq!(c.compare(&expected).unwrap(), 0, "bs={}", bs);
        }
    }

    #[test]
    fn test_rejects_mismatched_stores() {
        let a = BlockStore::<i64>::square(2, 4).unwrap();
        let b = BlockStore::<i64>::square(2, 8).unwrap();
        let mut c = BlockStore::<i64>::square(2, 4).unwrap();
        assert!(BlockMatMul::new(&a, &b, &mut c).is_err());

        let a = BlockStore::<i64>::new(2, 4, 4, 8).unwrap();
        let b = BlockStore::<i64>::square(2, 4).unwrap();
        let mut c = BlockStore::<i64>::square(2, 4).unwrap();
        assert!(matches!(
            BlockMatMul::new(&a, &b, &mut c),
            Err(BlockGemmError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Inline".parse::<StagingStrategy>().unwrap(), StagingStrategy::Inline);
        assert_eq!("bulk".parse::<StagingStrategy>().unwrap(), StagingStrategy::Bulk);
        assert!("lazy".parse::<StagingStrategy>().is_err());
    }
}
