use crate::preemption::PreemptionSnapshot;
use crate::sync::{Mutex, OnceLock, RwLock};
use crate::{config, occupancy};
use std::collections::VecDeque;

/// Static launch configuration of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub name: String,
    /// Unique launch id
    pub id: u64,
    /// Stream the kernel was submitted on
    pub stream_id: usize,
    /// 1-based sequence number of the kernel within its stream
    pub uid_in_stream: usize,
    pub threads_per_block: usize,
    pub num_registers: usize,
    pub shared_mem_bytes: usize,
    pub num_blocks: u64,
    /// Direction the kernel's blocks are placed in the hardware thread space.
    /// Kernels sharing a core alternate directions to keep their regions
    /// compact at opposite ends.
    pub allocate_from_top: bool,
}

/// Execution phase of a kernel, derived from its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Queued,
    Running,
    Done,
}

/// A kernel and its scheduling state.
///
/// The launch configuration is immutable; all mutable state sits behind the
/// sync wrappers so a kernel can be shared as `Arc<Kernel>` between the
/// admission table and the per-core slot indices.
pub struct Kernel {
    config: Launch,
    /// Blocks handed out so far (the next block id to dispatch).
    next_block: RwLock<u64>,
    running_blocks: RwLock<usize>,
    start_cycle: Mutex<Option<u64>>,
    completed_cycle: Mutex<Option<u64>>,
    usage: OnceLock<occupancy::Usage>,
    /// Assigned block quota per core. Zero means not yet assigned.
    quota: RwLock<usize>,
    /// Eviction requests issued on this kernel's behalf that have not yet
    /// produced a launched block.
    pending_preemptions: RwLock<usize>,
    /// Evicted blocks waiting to be relaunched, oldest first.
    preempted: Mutex<VecDeque<PreemptionSnapshot>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.config.name)
            .field("id", &self.config.id)
            .field("stream", &self.config.stream_id)
            .finish()
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.config.name, self.config.id)
    }
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        self.config.id == other.config.id
    }
}

impl Kernel {
    #[must_use]
    pub fn new(config: Launch) -> Self {
        Self {
            config,
            next_block: RwLock::new(0),
            running_blocks: RwLock::new(0),
            start_cycle: Mutex::new(None),
            completed_cycle: Mutex::new(None),
            usage: OnceLock::new(),
            quota: RwLock::new(0),
            pending_preemptions: RwLock::new(0),
            preempted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn id(&self) -> u64 {
        self.config.id
    }

    pub fn config(&self) -> &Launch {
        &self.config
    }

    /// Per-block resource footprint, computed on first use.
    pub fn usage(&self, config: &config::GPU) -> occupancy::Usage {
        *self.usage.get_or_init(|| {
            occupancy::compute(
                config,
                self.config.threads_per_block,
                self.config.num_registers,
                self.config.shared_mem_bytes,
            )
        })
    }

    // cold function
    pub fn set_started(&self, cycle: u64) {
        *self.start_cycle.lock() = Some(cycle);
    }

    // cold function
    pub fn set_completed(&self, cycle: u64) {
        *self.completed_cycle.lock() = Some(cycle);
    }

    pub fn launched(&self) -> bool {
        self.start_cycle.lock().is_some()
    }

    pub fn elapsed_cycles(&self) -> Option<u64> {
        let start_cycle = self.start_cycle.lock();
        let completed_cycle = self.completed_cycle.lock();
        match (*start_cycle, *completed_cycle) {
            (Some(start), Some(completed)) => Some(completed - start),
            _ => None,
        }
    }

    pub fn status(&self) -> Status {
        if self.done() {
            Status::Done
        } else if self.launched() {
            Status::Running
        } else {
            Status::Queued
        }
    }

    pub fn quota(&self) -> usize {
        *self.quota.read()
    }

    pub fn set_quota(&self, quota: usize) {
        *self.quota.write() = quota;
    }

    /// Hand out the next block id to dispatch.
    ///
    /// Evicted blocks are relaunched before any fresh block, so a kernel that
    /// has exhausted its grid can still have work outstanding.
    pub fn next_block(&self) -> Option<NextBlock> {
        if let Some(snapshot) = self.preempted.lock().pop_front() {
            return Some(NextBlock::Resume(Box::new(snapshot)));
        }
        let mut next = self.next_block.write();
        if *next >= self.config.num_blocks {
            return None;
        }
        let block_id = *next;
        *next += 1;
        Some(NextBlock::Fresh(block_id))
    }

    // hot
    pub fn increment_running_blocks(&self) {
        *self.running_blocks.write() += 1;
    }

    // hot
    pub fn decrement_running_blocks(&self) {
        let mut running = self.running_blocks.write();
        debug_assert!(*running > 0, "block retired on idle kernel {self}");
        *running = running.saturating_sub(1);
    }

    pub fn num_running_blocks(&self) -> usize {
        *self.running_blocks.read()
    }

    pub fn running(&self) -> bool {
        self.num_running_blocks() > 0
    }

    pub fn no_more_blocks_to_run(&self) -> bool {
        *self.next_block.read() >= self.config.num_blocks && self.preempted.lock().is_empty()
    }

    pub fn done(&self) -> bool {
        self.no_more_blocks_to_run() && !self.running()
    }

    /// Number of blocks not yet dispatched, including evicted blocks waiting
    /// for relaunch.
    pub fn blocks_left(&self) -> u64 {
        let fresh = self.config.num_blocks - *self.next_block.read();
        fresh + self.preempted.lock().len() as u64
    }

    /// True when the kernel still has blocks beyond the evictions already
    /// requested on its behalf. Prevents piling up preemption requests a
    /// kernel can never consume.
    pub fn more_blocks_than_pending(&self) -> bool {
        self.blocks_left() > *self.pending_preemptions.read() as u64
    }

    pub fn pending_preemptions(&self) -> usize {
        *self.pending_preemptions.read()
    }

    pub fn increment_pending_preemptions(&self) {
        *self.pending_preemptions.write() += 1;
    }

    /// Each successful launch consumes one outstanding request, whether or
    /// not that launch landed in an evicted slot.
    pub fn decrement_pending_preemptions(&self) {
        let mut pending = self.pending_preemptions.write();
        *pending = pending.saturating_sub(1);
    }

    pub fn push_preempted(&self, snapshot: PreemptionSnapshot) {
        self.preempted.lock().push_back(snapshot);
    }

    pub fn num_preempted_blocks(&self) -> usize {
        self.preempted.lock().len()
    }
}

/// Work item handed out by [`Kernel::next_block`].
#[derive(Debug)]
pub enum NextBlock {
    /// A block of the grid not dispatched before.
    Fresh(u64),
    /// An evicted block resuming from its saved state.
    Resume(Box<PreemptionSnapshot>),
}
