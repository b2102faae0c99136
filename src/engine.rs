use crate::kernel::Kernel;
use crate::preemption::PreemptionSnapshot;
use std::ops::Range;

/// Functional execution of threads, supplied by the surrounding simulator.
///
/// The scheduler only decides where blocks live; thread state itself
/// (registers, local memory, program counters) belongs to the collaborator
/// behind this trait.
pub trait FunctionalEngine {
    /// Bind a fresh block to a hardware thread range.
    ///
    /// Returns the number of threads that begin execution.
    fn init_block(
        &mut self,
        core_id: usize,
        threads: Range<usize>,
        kernel: &Kernel,
        block_id: u64,
    ) -> usize;

    /// Capture the state of an evicted block so it can resume elsewhere.
    fn snapshot_block(
        &mut self,
        core_id: usize,
        threads: Range<usize>,
        kernel: &Kernel,
        block_id: u64,
    ) -> PreemptionSnapshot;

    /// Restore an evicted block into a hardware thread range.
    ///
    /// Returns the number of threads that resume; threads recorded retired
    /// in the snapshot stay done and never restart.
    fn resume_block(
        &mut self,
        core_id: usize,
        threads: Range<usize>,
        kernel: &Kernel,
        snapshot: &PreemptionSnapshot,
    ) -> usize;
}

/// Shared memory / L1 split, supplied by the cache hierarchy.
pub trait CachePartition {
    /// Total shared memory reserved by the current quotas, in bytes.
    fn set_shared_memory_split(&mut self, reserved_bytes: usize);
}

/// Engine that runs no instructions.
///
/// Every thread of a fresh block starts; resumed blocks restart all threads
/// the snapshot did not record as retired. Used by the driver binary and the
/// tests.
#[derive(Debug, Default)]
pub struct SyntheticEngine {
    pub blocks_initialized: u64,
    pub blocks_snapshotted: u64,
    pub blocks_resumed: u64,
}

impl FunctionalEngine for SyntheticEngine {
    fn init_block(
        &mut self,
        _core_id: usize,
        threads: Range<usize>,
        _kernel: &Kernel,
        _block_id: u64,
    ) -> usize {
        self.blocks_initialized += 1;
        threads.len()
    }

    fn snapshot_block(
        &mut self,
        _core_id: usize,
        threads: Range<usize>,
        kernel: &Kernel,
        block_id: u64,
    ) -> PreemptionSnapshot {
        self.blocks_snapshotted += 1;
        PreemptionSnapshot::new(kernel.id(), block_id, threads.len())
    }

    fn resume_block(
        &mut self,
        _core_id: usize,
        _threads: Range<usize>,
        _kernel: &Kernel,
        snapshot: &PreemptionSnapshot,
    ) -> usize {
        self.blocks_resumed += 1;
        snapshot.num_threads - snapshot.num_retired()
    }
}

/// Cache partition that only remembers the last split, for tests and the
/// driver binary.
#[derive(Debug, Default)]
pub struct RecordingCachePartition {
    pub reserved_bytes: usize,
    pub updates: u64,
}

impl CachePartition for RecordingCachePartition {
    fn set_shared_memory_split(&mut self, reserved_bytes: usize) {
        self.reserved_bytes = reserved_bytes;
        self.updates += 1;
        log::debug!("shared memory split: {reserved_bytes} bytes reserved");
    }
}
