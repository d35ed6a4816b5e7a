//! Dependency graph over block accesses.
//!
//! Tasks are submitted in program order together with the blocks they read
//! and write. [`TaskGraph::submit`] derives the ordering edges from those
//! declarations, tracking for each block its last writer and the readers that
//! came after it:
//!
//! * a **read** waits for the last writer of the block;
//! * a **write** (or read-modify-write) waits for the last writer and for every
//!   reader since that write, then becomes the new last writer.
//!
//! Tasks whose declared block sets are disjoint never receive an edge, so the
//! executor is free to run them at the same time. Because edges only point from
//! earlier to later submissions, task ids are already a topological order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Which operand a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatrixRole {
    A,
    B,
    C,
}

impl fmt::Display for MatrixRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatrixRole::A => "A",
            MatrixRole::B => "B",
            MatrixRole::C => "C",
        };
        f.write_str(name)
    }
}

/// Address of one block of one operand, in block-store coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub matrix: MatrixRole,
    pub x: usize,
    pub y: usize,
}

impl BlockId {
    pub fn new(matrix: MatrixRole, x: usize, y: usize) -> Self {
        BlockId { matrix, x, y }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.matrix, self.x, self.y)
    }
}

/// How a task uses a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    #[inline]
    pub fn writes(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// One declared dependency of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub block: BlockId,
    pub mode: AccessMode,
}

impl Access {
    pub fn read(block: BlockId) -> Self {
        Access {
            block,
            mode: AccessMode::Read,
        }
    }

    pub fn write(block: BlockId) -> Self {
        Access {
            block,
            mode: AccessMode::Write,
        }
    }

    pub fn read_write(block: BlockId) -> Self {
        Access {
            block,
            mode: AccessMode::ReadWrite,
        }
    }
}

/// One block multiply-accumulate `C(i,j) += A(k,j) x B(i,k)`.
///
/// The factor pairing follows the block-store layout, where the first
/// coordinate walks flat columns and the second walks flat rows. With that
/// layout this pairing is the flat product `C = A x B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockTask {
    pub i: usize,
    pub j: usize,
    pub k: usize,
}

impl BlockTask {
    pub fn new(i: usize, j: usize, k: usize) -> Self {
        BlockTask { i, j, k }
    }

    #[inline]
    pub fn a(&self) -> BlockId {
        BlockId::new(MatrixRole::A, self.k, self.j)
    }

    #[inline]
    pub fn b(&self) -> BlockId {
        BlockId::new(MatrixRole::B, self.i, self.k)
    }

    #[inline]
    pub fn c(&self) -> BlockId {
        BlockId::new(MatrixRole::C, self.i, self.j)
    }

    pub fn accesses(&self) -> [Access; 3] {
        [
            Access::read(self.a()),
            Access::read(self.b()),
            Access::read_write(self.c()),
        ]
    }
}

impl fmt::Display for BlockTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} += {} x {}", self.c(), self.a(), self.b())
    }
}

/// Work carried by a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Make a block resident on the target.
    StageIn(BlockId),
    /// Multiply-accumulate one block triple. With `inline` set the task stages
    /// its own operands in and its accumulator out around the kernel.
    Multiply { task: BlockTask, inline: bool },
    /// Copy a block back from the target and drop its residency.
    StageOut(BlockId),
    /// Drop a block's residency without copying it back.
    Release(BlockId),
}

impl TaskKind {
    /// Blocks this kind of task touches, in declaration order.
    pub fn accesses(&self) -> Vec<Access> {
        match *self {
            TaskKind::StageIn(block) => vec![Access::write(block)],
            TaskKind::Multiply { task, .. } => task.accesses().to_vec(),
            TaskKind::StageOut(block) | TaskKind::Release(block) => {
                vec![Access::read_write(block)]
            }
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::StageIn(block) => write!(f, "stage-in {}", block),
            TaskKind::Multiply { task, .. } => write!(f, "{}", task),
            TaskKind::StageOut(block) => write!(f, "stage-out {}", block),
            TaskKind::Release(block) => write!(f, "release {}", block),
        }
    }
}

/// Index of a task in its graph, equal to its submission position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct TaskNode {
    id: TaskId,
    kind: TaskKind,
    accesses: Vec<Access>,
    predecessors: Vec<TaskId>,
    successors: Vec<TaskId>,
}

impl TaskNode {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn predecessors(&self) -> &[TaskId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[TaskId] {
        &self.successors
    }
}

#[derive(Debug, Default)]
struct BlockState {
    last_writer: Option<TaskId>,
    readers: Vec<TaskId>,
}

/// Tasks plus the ordering edges derived from their block accesses.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    blocks: HashMap<BlockId, BlockState>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task and wires it after every earlier task it conflicts with.
    pub fn submit(&mut self, kind: TaskKind) -> TaskId {
        let id = TaskId(self.nodes.len());
        let accesses = kind.accesses();

        let mut predecessors = Vec::new();
        for access in &accesses {
            let state = self.blocks.entry(access.block).or_default();
            if let Some(writer) = state.last_writer {
                predecessors.push(writer);
            }
            if access.mode.writes() {
                predecessors.append(&mut state.readers);
                state.last_writer = Some(id);
            } else {
                state.readers.push(id);
            }
        }
        predecessors.sort_unstable();
        predecessors.dedup();
        predecessors.retain(|&p| p != id);

        for &p in &predecessors {
            self.nodes[p.0].successors.push(id);
        }

        self.nodes.push(TaskNode {
            id,
            kind,
            accesses,
            predecessors,
            successors: Vec::new(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    pub fn node(&self, id: TaskId) -> &TaskNode {
        &self.nodes[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    /// Tasks with no predecessors, ready as soon as execution starts.
    pub fn roots(&self) -> Vec<TaskId> {
        self.nodes
            .iter()
            .filter(|n| n.predecessors.is_empty())
            .map(|n| n.id)
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.successors.len()).sum()
    }

    /// Whether `to` is reachable from `from` through at least one edge.
    pub fn has_path(&self, from: TaskId, to: TaskId) -> bool {
        // Edges only go forward in submission order.
        if to <= from {
            return false;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for &next in &self.nodes[current.0].successors {
                if next == to {
                    return true;
                }
                if next < to && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// Whether the two tasks may legally run at the same time.
    pub fn independent(&self, a: TaskId, b: TaskId) -> bool {
        !self.has_path(a, b) && !self.has_path(b, a)
    }
}
