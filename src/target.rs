//! Execution targets: where block products run and how block data gets there.
//!
//! A target exposes two transfers, [`ExecutionTarget::stage_in`] and
//! [`ExecutionTarget::stage_out`], plus [`ExecutionTarget::release`] for blocks
//! whose device copy is discarded, and [`ExecutionTarget::launch`] to run one
//! block product. The same task graph runs against any target.
//!
//! * [`HostTarget`] computes directly on the host blocks. Transfers are no-ops.
//! * [`DeviceTarget`] keeps its own copy of every resident block and computes
//!   only on those copies, the way an accelerator with separate memory would.
//!   Residency is reference counted per block: the first stage-in copies the
//!   block over, later ones only take a reference. The block is copied back (or
//!   dropped, for a release) when the last reference goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};

use crate::element::Element;
use crate::error::{access_conflict, staging_error, task_failed, Result};
use crate::graph::{BlockId, BlockTask, MatrixRole};
use crate::kernel::KernelMode;
use crate::store::BlockStore;

/// Host-side storage of the three operands of one product.
pub struct HostMemory<'a, T> {
    a: &'a BlockStore<T>,
    b: &'a BlockStore<T>,
    c: &'a BlockStore<T>,
}

impl<'a, T: Element> HostMemory<'a, T> {
    pub fn new(a: &'a BlockStore<T>, b: &'a BlockStore<T>, c: &'a BlockStore<T>) -> Self {
        HostMemory { a, b, c }
    }

    pub fn store(&self, role: MatrixRole) -> &'a BlockStore<T> {
        match role {
            MatrixRole::A => self.a,
            MatrixRole::B => self.b,
            MatrixRole::C => self.c,
        }
    }

    /// Edge length of the square blocks.
    pub fn block_size(&self) -> usize {
        self.c.rows_per_block()
    }

    /// Borrows a host block for reading without waiting.
    pub fn read(&self, block: BlockId) -> Result<RwLockReadGuard<'a, Vec<T>>> {
        self.store(block.matrix)
            .try_read(block.x, block.y)
            .ok_or_else(|| access_conflict(block, "host block is being written by another task"))
    }

    /// Borrows a host block for writing without waiting.
    pub fn write(&self, block: BlockId) -> Result<RwLockWriteGuard<'a, Vec<T>>> {
        self.store(block.matrix)
            .try_write(block.x, block.y)
            .ok_or_else(|| access_conflict(block, "host block is borrowed by another task"))
    }
}

/// A place where block products can run.
pub trait ExecutionTarget<T: Element>: Send + Sync {
    fn name(&self) -> &str;

    /// Makes `block` available to kernels on this target.
    fn stage_in(&self, block: BlockId, host: &[T]) -> Result<()>;

    /// Drops one residency reference, copying the block back into `host` if it
    /// was the last.
    fn stage_out(&self, block: BlockId, host: &mut [T]) -> Result<()>;

    /// Drops one residency reference without copying anything back.
    fn release(&self, block: BlockId) -> Result<()>;

    /// Runs `C(i,j) += A(k,j) x B(i,k)` for one block triple.
    fn launch(&self, task: &BlockTask, host: &HostMemory<'_, T>, kernel: KernelMode)
        -> Result<()>;
}

/// Runs every kernel on host memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTarget;

impl<T: Element> ExecutionTarget<T> for HostTarget {
    fn name(&self) -> &str {
        "host"
    }

    fn stage_in(&self, _block: BlockId, _host: &[T]) -> Result<()> {
        Ok(())
    }

    fn stage_out(&self, _block: BlockId, _host: &mut [T]) -> Result<()> {
        Ok(())
    }

    fn release(&self, _block: BlockId) -> Result<()> {
        Ok(())
    }

    fn launch(
        &self,
        task: &BlockTask,
        host: &HostMemory<'_, T>,
        kernel: KernelMode,
    ) -> Result<()> {
        let a = host.read(task.a())?;
        let b = host.read(task.b())?;
        let mut c = host.write(task.c())?;
        kernel.run(&a, &b, &mut c, host.block_size());
        Ok(())
    }
}

/// Snapshot of a [`DeviceTarget`]'s transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// `stage_in` calls.
    pub stage_ins: usize,
    /// Stage-ins that actually copied data to the device.
    pub copies_in: usize,
    /// `stage_out` calls.
    pub stage_outs: usize,
    /// Stage-outs that actually copied data back to the host.
    pub copies_out: usize,
    /// `release` calls.
    pub releases: usize,
    /// Kernel launches, including any that were refused.
    pub launches: usize,
    pub bytes_in: usize,
    pub bytes_out: usize,
}

#[derive(Debug, Default)]
struct TransferCounters {
    stage_ins: AtomicUsize,
    copies_in: AtomicUsize,
    stage_outs: AtomicUsize,
    copies_out: AtomicUsize,
    releases: AtomicUsize,
    launches: AtomicUsize,
    bytes_in: AtomicUsize,
    bytes_out: AtomicUsize,
}

impl TransferCounters {
    fn snapshot(&self) -> TransferStats {
        TransferStats {
            stage_ins: self.stage_ins.load(Ordering::Relaxed),
            copies_in: self.copies_in.load(Ordering::Relaxed),
            stage_outs: self.stage_outs.load(Ordering::Relaxed),
            copies_out: self.copies_out.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Device-side state of one resident block.
#[derive(Debug)]
struct StagingRecord<T> {
    refs: usize,
    data: Arc<RwLock<Vec<T>>>,
}

/// Simulated accelerator with its own block memory.
///
/// Kernels launched here never see host memory: operands must have been staged
/// in, and results only reach the host through [`ExecutionTarget::stage_out`].
#[derive(Debug)]
pub struct DeviceTarget<T> {
    memory: RwLock<HashMap<BlockId, StagingRecord<T>>>,
    counters: TransferCounters,
    fail_after: Option<usize>,
}

impl<T: Element> Default for DeviceTarget<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> DeviceTarget<T> {
    pub fn new() -> Self {
        DeviceTarget {
            memory: RwLock::new(HashMap::new()),
            counters: TransferCounters::default(),
            fail_after: None,
        }
    }

    /// A device whose kernel launches fail once `launches` have succeeded.
    pub fn fail_after_launches(launches: usize) -> Self {
        DeviceTarget {
            fail_after: Some(launches),
            ..Self::new()
        }
    }

    pub fn stats(&self) -> TransferStats {
        self.counters.snapshot()
    }

    /// Number of blocks currently resident.
    pub fn resident_blocks(&self) -> usize {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_resident(&self, block: BlockId) -> bool {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&block)
    }

    fn resident(&self, block: BlockId) -> Result<Arc<RwLock<Vec<T>>>> {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&block)
            .map(|record| Arc::clone(&record.data))
            .ok_or_else(|| staging_error(block, "kernel operand is not resident on the device"))
    }

    /// Drops one reference to `block`, returning its data if that was the last one.
    fn unreference(&self, block: BlockId) -> Result<Option<Arc<RwLock<Vec<T>>>>> {
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        let record = memory
            .get_mut(&block)
            .ok_or_else(|| staging_error(block, "block is not resident on the device"))?;
        record.refs -= 1;
        if record.refs > 0 {
            return Ok(None);
        }
        Ok(memory.remove(&block).map(|record| record.data))
    }
}

fn read_resident<T>(
    block: BlockId,
    data: &RwLock<Vec<T>>,
) -> Result<RwLockReadGuard<'_, Vec<T>>> {
    match data.try_read() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(access_conflict(
            block,
            "device block is being written by another task",
        )),
    }
}

fn write_resident<T>(
    block: BlockId,
    data: &RwLock<Vec<T>>,
) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
    match data.try_write() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(access_conflict(
            block,
            "device block is borrowed by another task",
        )),
    }
}

impl<T: Element> ExecutionTarget<T> for DeviceTarget<T> {
    fn name(&self) -> &str {
        "device"
    }

    fn stage_in(&self, block: BlockId, host: &[T]) -> Result<()> {
        self.counters.stage_ins.fetch_add(1, Ordering::Relaxed);

        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = memory.get_mut(&block) {
            record.refs += 1;
            return Ok(());
        }
        memory.insert(
            block,
            StagingRecord {
                refs: 1,
                data: Arc::new(RwLock::new(host.to_vec())),
            },
        );
        self.counters.copies_in.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_in
            .fetch_add(std::mem::size_of_val(host), Ordering::Relaxed);
        Ok(())
    }

    fn stage_out(&self, block: BlockId, host: &mut [T]) -> Result<()> {
        self.counters.stage_outs.fetch_add(1, Ordering::Relaxed);

        if let Some(data) = self.unreference(block)? {
            let device = read_resident(block, &data)?;
            host.copy_from_slice(&device);
            self.counters.copies_out.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_out
                .fetch_add(std::mem::size_of_val(host), Ordering::Relaxed);
        }
        Ok(())
    }

    fn release(&self, block: BlockId) -> Result<()> {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.unreference(block).map(|_| ())
    }

    fn launch(
        &self,
        task: &BlockTask,
        host: &HostMemory<'_, T>,
        kernel: KernelMode,
    ) -> Result<()> {
        let launched = self.counters.launches.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = self.fail_after {
            if launched >= limit {
                return Err(task_failed(task.to_string(), "device execution failed"));
            }
        }

        let a = self.resident(task.a())?;
        let b = self.resident(task.b())?;
        let c = self.resident(task.c())?;

        let a = read_resident(task.a(), &a)?;
        let b = read_resident(task.b(), &b)?;
        let mut c = write_resident(task.c(), &c)?;
        kernel.run(&a, &b, &mut c, host.block_size());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockGemmError;

    fn stores() -> (BlockStore<i64>, BlockStore<i64>, BlockStore<i64>) {
        let a = BlockStore::from_flat(2, 2, 2, 2, &[1, 2, 3, 4]).unwrap();
        let b = BlockStore::from_flat(2, 2, 2, 2, &[5, 6, 7, 8]).unwrap();
        let c = BlockStore::square(2, 2).unwrap();
        (a, b, c)
    }

    fn stage_all(device: &DeviceTarget<i64>, host: &HostMemory<'_, i64>, task: &BlockTask) {
        for block in [task.a(), task.b(), task.c()] {
            device.stage_in(block, &host.read(block).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_host_launch_updates_host_block() {
        let (a, b, c) = stores();
        let host = HostMemory::new(&a, &b, &c);
        let task = BlockTask::new(0, 0, 0);

        HostTarget.launch(&task, &host, KernelMode::Serial).unwrap();
        assert_eq!(*c.block(0, 0), vec![19, 22, 43, 50]);
    }

    #[test]
    fn test_host_launch_reports_conflicting_borrow() {
        let (a, b, c) = stores();
        let host = HostMemory::new(&a, &b, &c);
        let task = BlockTask::new(0, 0, 0);

        let _held = c.try_read(0, 0).unwrap();
        let err = HostTarget.launch(&task, &host, KernelMode::Serial).unwrap_err();
        assert!(matches!(err, BlockGemmError::AccessConflict { .. }));
    }

    #[test]
    fn test_device_computes_on_resident_copies() {
        let (a, b, mut c) = stores();
        let device = DeviceTarget::<i64>::new();
        let task = BlockTask::new(0, 0, 0);
        {
            let host = HostMemory::new(&a, &b, &c);
            stage_all(&device, &host, &task);
            device.launch(&task, &host, KernelMode::Serial).unwrap();
            // Nothing reaches the host before stage-out.
            assert_eq!(*c.block(0, 0), vec![0, 0, 0, 0]);
        }

        device.stage_out(task.c(), c.block_mut(0, 0)).unwrap();
        device.release(task.a()).unwrap();
        device.release(task.b()).unwrap();

        assert_eq!(*c.block(0, 0), vec![19, 22, 43, 50]);
        assert_eq!(device.resident_blocks(), 0);
    }

    #[test]
    fn test_device_residency_is_reference_counted() {
        let (a, _, _) = stores();
        let device = DeviceTarget::<i64>::new();
        let block = BlockId::new(MatrixRole::A, 0, 0);

        device.stage_in(block, &a.block(0, 0)).unwrap();
        device.stage_in(block, &a.block(0, 0)).unwrap();
        let mut host = vec![0i64; 4];
        device.stage_out(block, &mut host).unwrap();
        assert!(device.is_resident(block));
        assert_eq!(host, vec![0, 0, 0, 0]);

        device.stage_out(block, &mut host).unwrap();
        assert!(!device.is_resident(block));
        assert_eq!(host, vec![1, 2, 3, 4]);

        let stats = device.stats();
        assert_eq!(stats.stage_ins, 2);
        assert_eq!(stats.copies_in, 1);
        assert_eq!(stats.stage_outs, 2);
        assert_eq!(stats.copies_out, 1);
        assert_eq!(stats.bytes_in, 4 * std::mem::size_of::<i64>());
    }

    #[test]
    fn test_device_refuses_non_resident_blocks() {
        let (a, b, c) = stores();
        let host = HostMemory::new(&a, &b, &c);
        let device = DeviceTarget::<i64>::new();
        let task = BlockTask::new(0, 0, 0);

        let err = device.launch(&task, &host, KernelMode::Serial).unwrap_err();
        assert!(matches!(err, BlockGemmError::StagingError { .. }));

        let err = device.release(task.a()).unwrap_err();
        assert!(matches!(err, BlockGemmError::StagingError { .. }));
    }

    #[test]
    fn test_injected_failure() {
        let (a, b, c) = stores();
        let host = HostMemory::new(&a, &b, &c);
        let device = DeviceTarget::fail_after_launches(1);
        let task = BlockTask::new(0, 0, 0);
        stage_all(&device, &host, &task);

        device.launch(&task, &host, KernelMode::Serial).unwrap();
        let err = device.launch(&task, &host, KernelMode::Serial).unwrap_err();
        assert!(matches!(err, BlockGemmError::TaskFailed { .. }));
    }
}
