//! Dependency-counting executor on top of a Rayon scope.
//!
//! Every task starts with a counter equal to its number of predecessors. The
//! roots are spawned immediately. When a task finishes it decrements each
//! successor's counter, and the task that brings a counter to zero spawns that
//! successor. A task that is still waiting on predecessors is simply not yet
//! spawned, so no worker is ever parked on it; the only blocking wait is the
//! scope join at the end.
//!
//! The first failing task aborts the run: its successors are never released,
//! tasks already spawned skip their work, and the error is returned once the
//! scope drains.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use rayon::ThreadPool;

use crate::error::{task_failed, BlockGemmError, Result};
use crate::graph::{TaskGraph, TaskId, TaskNode};

/// What a completed run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Tasks whose work ran to completion.
    pub tasks_executed: usize,
}

type TaskFn<'f> = dyn Fn(&TaskNode) -> Result<()> + Sync + 'f;

struct RunState<'g> {
    graph: &'g TaskGraph,
    run: &'g TaskFn<'g>,
    remaining: Vec<AtomicUsize>,
    aborted: AtomicBool,
    failure: Mutex<Option<BlockGemmError>>,
    executed: AtomicUsize,
}

impl RunState<'_> {
    fn fail(&self, node: &TaskNode, error: BlockGemmError) {
        log::error!("task {} ({}) failed: {}", node.id(), node.kind(), error);
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
        self.aborted.store(true, Ordering::Release);
    }
}

fn spawn_task<'s>(scope: &rayon::Scope<'s>, state: &'s RunState<'s>, id: TaskId) {
    scope.spawn(move |scope| {
        if state.aborted.load(Ordering::Acquire) {
            return;
        }

        let node = state.graph.node(id);
        log::trace!("running task {} ({})", id, node.kind());
        if let Err(error) = (state.run)(node) {
            state.fail(node, error);
            return;
        }
        state.executed.fetch_add(1, Ordering::Relaxed);

        for &next in node.successors() {
            if state.remaining[next.index()].fetch_sub(1, Ordering::AcqRel) == 1 {
                spawn_task(scope, state, next);
            }
        }
    });
}

/// Runs every task of `graph` on `pool`, honoring its edges.
///
/// `run` is called once per task, possibly from several worker threads at the
/// same time for tasks that are independent in the graph.
///
/// # Errors
///
/// Returns the first error produced by `run`; the remaining tasks are skipped.
pub fn execute<F>(graph: &TaskGraph, pool: &ThreadPool, run: F) -> Result<ExecutionStats>
where
    F: Fn(&TaskNode) -> Result<()> + Sync,
{
    let state = RunState {
        graph,
        run: &run,
        remaining: graph
            .iter()
            .map(|node| AtomicUsize::new(node.predecessors().len()))
            .collect(),
        aborted: AtomicBool::new(false),
        failure: Mutex::new(None),
        executed: AtomicUsize::new(0),
    };

    let roots = graph.roots();
    log::debug!(
        "executing {} tasks ({} ready) on {} threads",
        graph.len(),
        roots.len(),
        pool.current_num_threads()
    );

    pool.scope(|scope| {
        for id in roots {
            spawn_task(scope, &state, id);
        }
    });

    if let Some(error) = state
        .failure
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
    {
        return Err(error);
    }

    let executed = state.executed.into_inner();
    if executed != graph.len() {
        return Err(task_failed(
            "graph",
            format!("only {} of {} tasks became ready", executed, graph.len()),
        ));
    }
    Ok(ExecutionStats {
        tasks_executed: executed,
    })
}
