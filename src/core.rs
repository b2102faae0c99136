use crate::engine::FunctionalEngine;
use crate::kernel::{Kernel, NextBlock};
use crate::sync::Arc;
use crate::config;
use bitvec::{array::BitArray, BitArr};
use indexmap::IndexMap;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LaunchError {
    #[error("{required} threads required but only {free} free")]
    InsufficientThreads { required: usize, free: usize },

    #[error("no contiguous run of {required} free hardware thread ids")]
    NoContiguousSlot { required: usize },

    #[error("{required} bytes of shared memory required but only {free} free")]
    InsufficientSharedMem { required: usize, free: usize },

    #[error("{required} registers required but only {free} free")]
    InsufficientRegisters { required: usize, free: usize },

    #[error("no free block slot")]
    NoFreeBlockSlot,

    #[error("kernel has no blocks left to issue")]
    NoBlocksLeft,
}

/// One occupied hardware block slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSlot {
    pub kernel_id: u64,
    pub block_id: u64,
    /// First hardware thread id of the block's range.
    pub start_thread: usize,
    /// Occupied range length (whole warps).
    pub padded_size: usize,
    /// Threads of the block still executing.
    pub threads_in_block: usize,
    pub registers: usize,
    pub shared_mem_bytes: usize,
    /// Marked by an eviction pass; the block drains and is snapshotted.
    pub selected_for_preemption: bool,
}

impl BlockSlot {
    #[must_use]
    pub fn thread_range(&self) -> std::ops::Range<usize> {
        self.start_thread..self.start_thread + self.padded_size
    }
}

/// Result of a successful block launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLaunch {
    pub slot_id: usize,
    pub block_id: u64,
    pub start_thread: usize,
    /// The launch consumed an eviction snapshot instead of fresh init.
    pub resumed: bool,
}

/// Hardware slot state of one core.
///
/// Tracks which hardware thread ids, registers, shared memory and block
/// slots are occupied, and by which kernel. All four aggregates are kept
/// alongside the bitmap; they must never disagree with it.
pub struct Core {
    pub core_id: usize,
    config: Arc<config::GPU>,
    occupied_hw_thread_ids: BitArr!(for crate::MAX_THREADS_PER_CORE),
    num_occupied_threads: usize,
    num_occupied_registers: usize,
    num_occupied_shared_mem: usize,
    num_occupied_blocks: usize,
    block_slots: Box<[Option<BlockSlot>]>,
    /// Block slots held per kernel, in launch order. Insertion-ordered so
    /// victim scans are deterministic.
    kernel_blocks: IndexMap<u64, Vec<usize>>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("core_id", &self.core_id)
            .field("occupied_threads", &self.num_occupied_threads)
            .field("occupied_registers", &self.num_occupied_registers)
            .field("occupied_shared_mem", &self.num_occupied_shared_mem)
            .field("occupied_blocks", &self.num_occupied_blocks)
            .finish()
    }
}

impl Core {
    #[must_use]
    pub fn new(core_id: usize, config: Arc<config::GPU>) -> Self {
        assert!(config.max_threads_per_core <= crate::MAX_THREADS_PER_CORE);
        let block_slots = vec![None; config.max_concurrent_blocks_per_core].into_boxed_slice();
        Self {
            core_id,
            config,
            occupied_hw_thread_ids: BitArray::ZERO,
            num_occupied_threads: 0,
            num_occupied_registers: 0,
            num_occupied_shared_mem: 0,
            num_occupied_blocks: 0,
            block_slots,
            kernel_blocks: IndexMap::new(),
        }
    }

    pub fn config(&self) -> &config::GPU {
        &self.config
    }

    pub fn num_occupied_blocks(&self) -> usize {
        self.num_occupied_blocks
    }

    pub fn num_occupied_threads(&self) -> usize {
        self.num_occupied_threads
    }

    pub fn num_occupied_registers(&self) -> usize {
        self.num_occupied_registers
    }

    pub fn num_occupied_shared_mem(&self) -> usize {
        self.num_occupied_shared_mem
    }

    pub fn is_active(&self) -> bool {
        self.num_occupied_blocks > 0
    }

    pub fn block_slot(&self, slot_id: usize) -> Option<&BlockSlot> {
        self.block_slots.get(slot_id).and_then(Option::as_ref)
    }

    pub fn block_slot_mut(&mut self, slot_id: usize) -> Option<&mut BlockSlot> {
        self.block_slots.get_mut(slot_id).and_then(Option::as_mut)
    }

    pub fn block_slots(&self) -> impl Iterator<Item = (usize, &BlockSlot)> {
        self.block_slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|slot| (id, slot)))
    }

    /// Slot ids held by a kernel on this core, in launch order.
    pub fn blocks_of_kernel(&self, kernel_id: u64) -> &[usize] {
        self.kernel_blocks
            .get(&kernel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn num_running_blocks(&self, kernel_id: u64) -> usize {
        self.blocks_of_kernel(kernel_id).len()
    }

    /// Kernels with live blocks on this core, in first-launch order.
    pub fn resident_kernels(&self) -> impl Iterator<Item = u64> + '_ {
        self.kernel_blocks
            .iter()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(kernel_id, _)| *kernel_id)
    }

    /// A block marked for eviction has not been snapshotted yet.
    pub fn preemption_in_progress(&self) -> bool {
        self.block_slots
            .iter()
            .flatten()
            .any(|slot| slot.selected_for_preemption)
    }

    /// First run of `size` free hardware thread ids, stepping by `size`.
    ///
    /// Top-allocating kernels scan from the low end, bottom-allocating ones
    /// from the high end, so the two populations grow towards each other.
    pub fn scan_free_range(&self, size: usize, from_top: bool) -> Option<usize> {
        let max_threads = self.config.max_threads_per_core;
        debug_assert!(size > 0 && size <= max_threads);
        if from_top {
            let mut step = 0;
            while step + size <= max_threads {
                if self.occupied_hw_thread_ids[step..step + size].not_any() {
                    return Some(step);
                }
                step += size;
            }
        } else {
            let mut step = (max_threads - size) as isize;
            while step >= 0 {
                let start = step as usize;
                if self.occupied_hw_thread_ids[start..start + size].not_any() {
                    return Some(start);
                }
                step -= size as isize;
            }
        }
        None
    }

    /// Check all four resources and contiguity without occupying anything.
    pub fn check_resources(&self, kernel: &Kernel) -> Result<(), LaunchError> {
        let launch = kernel.config();
        let padded_size = self.config.threads_per_block_padded(launch.threads_per_block);

        if !self.config.concurrent_kernel_sm {
            if self.num_occupied_blocks < self.config.max_blocks(kernel) {
                return Ok(());
            }
            return Err(LaunchError::NoFreeBlockSlot);
        }

        if self.num_occupied_threads + padded_size > self.config.max_threads_per_core {
            return Err(LaunchError::InsufficientThreads {
                required: padded_size,
                free: self.config.max_threads_per_core - self.num_occupied_threads,
            });
        }

        if self
            .scan_free_range(padded_size, launch.allocate_from_top)
            .is_none()
        {
            return Err(LaunchError::NoContiguousSlot {
                required: padded_size,
            });
        }

        if self.num_occupied_shared_mem + launch.shared_mem_bytes > self.config.shared_memory_size {
            return Err(LaunchError::InsufficientSharedMem {
                required: launch.shared_mem_bytes,
                free: self.config.shared_memory_size - self.num_occupied_shared_mem,
            });
        }

        let used_regs = padded_size * crate::occupancy::rounded_registers(launch.num_registers);
        if self.num_occupied_registers + used_regs > self.config.shader_registers {
            return Err(LaunchError::InsufficientRegisters {
                required: used_regs,
                free: self.config.shader_registers - self.num_occupied_registers,
            });
        }

        if self.num_occupied_blocks + 1 > self.config.max_concurrent_blocks_per_core {
            return Err(LaunchError::NoFreeBlockSlot);
        }

        Ok(())
    }

    /// Lowest free slot for top-allocating kernels, highest otherwise.
    fn find_free_block_slot(&self, from_top: bool) -> Option<usize> {
        if !self.config.concurrent_kernel_sm || from_top {
            self.block_slots.iter().position(Option::is_none)
        } else {
            self.block_slots.iter().rposition(Option::is_none)
        }
    }

    /// Launch the kernel's next block into this core.
    ///
    /// All-or-nothing: on any error nothing is occupied and the kernel's
    /// dispatch counter is untouched. A queued eviction snapshot of the
    /// kernel is consumed before any fresh block.
    #[tracing::instrument(skip(engine))]
    pub fn issue_block<E: FunctionalEngine>(
        &mut self,
        kernel: &Arc<Kernel>,
        engine: &mut E,
        cycle: u64,
    ) -> Result<BlockLaunch, LaunchError> {
        let launch = kernel.config();
        let padded_size = self.config.threads_per_block_padded(launch.threads_per_block);

        self.check_resources(kernel)?;

        let slot_id = self
            .find_free_block_slot(launch.allocate_from_top)
            .ok_or(LaunchError::NoFreeBlockSlot)?;

        let start_thread = if self.config.concurrent_kernel_sm {
            self.scan_free_range(padded_size, launch.allocate_from_top)
                .ok_or(LaunchError::NoContiguousSlot {
                    required: padded_size,
                })?
        } else {
            slot_id * padded_size
        };

        let next = kernel.next_block().ok_or(LaunchError::NoBlocksLeft)?;

        // past this point the launch cannot fail
        self.occupied_hw_thread_ids[start_thread..start_thread + padded_size].fill(true);
        self.num_occupied_threads += padded_size;
        self.num_occupied_shared_mem += launch.shared_mem_bytes;
        let used_regs = padded_size * crate::occupancy::rounded_registers(launch.num_registers);
        self.num_occupied_registers += used_regs;
        self.num_occupied_blocks += 1;

        let threads = start_thread..start_thread + launch.threads_per_block;
        let (block_id, threads_in_block, resumed) = match next {
            NextBlock::Fresh(block_id) => {
                let active = engine.init_block(self.core_id, threads, kernel, block_id);
                (block_id, active, false)
            }
            NextBlock::Resume(snapshot) => {
                let active = engine.resume_block(self.core_id, threads, kernel, &snapshot);
                (snapshot.block_id, active, true)
            }
        };
        assert!(
            threads_in_block > 0 && threads_in_block <= self.config.max_threads_per_core,
            "core {}: block {block_id} of kernel {kernel} started with {threads_in_block} threads",
            self.core_id
        );

        debug_assert!(self.block_slots[slot_id].is_none());
        self.block_slots[slot_id] = Some(BlockSlot {
            kernel_id: kernel.id(),
            block_id,
            start_thread,
            padded_size,
            threads_in_block,
            registers: used_regs,
            shared_mem_bytes: launch.shared_mem_bytes,
            selected_for_preemption: false,
        });
        self.kernel_blocks
            .entry(kernel.id())
            .or_default()
            .push(slot_id);

        kernel.increment_running_blocks();
        kernel.decrement_pending_preemptions();

        log::debug!(
            "core {}: issued block {} of {} in slot {} (threads {}..{}) cycle {}",
            self.core_id,
            block_id,
            kernel,
            slot_id,
            start_thread,
            start_thread + padded_size,
            cycle
        );

        Ok(BlockLaunch {
            slot_id,
            block_id,
            start_thread,
            resumed,
        })
    }

    /// Free a block slot and return it.
    ///
    /// Accounting corruption here means the simulation already diverged, so
    /// the asserts are fatal.
    pub fn release_block(&mut self, slot_id: usize) -> BlockSlot {
        let Some(slot) = self.block_slots[slot_id].take() else {
            panic!("core {}: release of free block slot {slot_id}", self.core_id);
        };

        assert!(
            self.num_occupied_threads >= slot.padded_size,
            "core {}: thread accounting underflow releasing slot {slot_id} ({} occupied, {} to release)",
            self.core_id,
            self.num_occupied_threads,
            slot.padded_size
        );
        assert!(
            self.num_occupied_shared_mem >= slot.shared_mem_bytes,
            "core {}: shared memory accounting underflow releasing slot {slot_id}",
            self.core_id
        );
        assert!(
            self.num_occupied_registers >= slot.registers,
            "core {}: register accounting underflow releasing slot {slot_id}",
            self.core_id
        );
        assert!(self.num_occupied_blocks >= 1);

        debug_assert!(self.occupied_hw_thread_ids[slot.thread_range()].all());
        self.occupied_hw_thread_ids[slot.thread_range()].fill(false);
        self.num_occupied_threads -= slot.padded_size;
        self.num_occupied_shared_mem -= slot.shared_mem_bytes;
        self.num_occupied_registers -= slot.registers;
        self.num_occupied_blocks -= 1;

        let slots = self
            .kernel_blocks
            .get_mut(&slot.kernel_id)
            .unwrap_or_else(|| {
                panic!(
                    "core {}: slot {slot_id} owned by untracked kernel {}",
                    self.core_id, slot.kernel_id
                )
            });
        slots.retain(|&id| id != slot_id);
        if slots.is_empty() {
            self.kernel_blocks.shift_remove(&slot.kernel_id);
        }

        log::debug!(
            "core {}: released block {} of kernel {} from slot {}",
            self.core_id,
            slot.block_id,
            slot.kernel_id,
            slot_id
        );
        slot
    }

    /// Kernel owning a hardware thread id, if any slot covers it.
    pub fn owner_of_thread(&self, hw_thread_id: usize) -> Option<&BlockSlot> {
        self.block_slots
            .iter()
            .flatten()
            .find(|slot| slot.thread_range().contains(&hw_thread_id))
    }

    pub fn thread_occupied(&self, hw_thread_id: usize) -> bool {
        self.occupied_hw_thread_ids[hw_thread_id]
    }
}

#[cfg(test)]
mod tests {
    use super::{Core, LaunchError};
    use crate::config;
    use crate::engine::SyntheticEngine;
    use crate::kernel::{Kernel, Launch};
    use crate::sync::Arc;

    fn kernel(id: u64, threads: usize, smem: usize, num_blocks: u64, from_top: bool) -> Arc<Kernel> {
        Arc::new(Kernel::new(Launch {
            name: format!("k{id}"),
            id,
            stream_id: id as usize % 2,
            uid_in_stream: 1,
            threads_per_block: threads,
            num_registers: 16,
            shared_mem_bytes: smem,
            num_blocks,
            allocate_from_top: from_top,
        }))
    }

    fn core() -> Core {
        Core::new(0, Arc::new(config::GPU::default()))
    }

    #[test]
    fn top_allocation_yields_increasing_disjoint_ranges() {
        let mut core = core();
        let mut engine = SyntheticEngine::default();
        let k = kernel(1, 256, 0, 8, true);
        let a = core.issue_block(&k, &mut engine, 0).unwrap();
        let b = core.issue_block(&k, &mut engine, 1).unwrap();
        let c = core.issue_block(&k, &mut engine, 2).unwrap();
        assert_eq!(a.start_thread, 0);
        assert_eq!(b.start_thread, 256);
        assert_eq!(c.start_thread, 512);
        assert_eq!((a.slot_id, b.slot_id, c.slot_id), (0, 1, 2));
    }

    #[test]
    fn bottom_allocation_yields_decreasing_disjoint_ranges() {
        let mut core = core();
        let mut engine = SyntheticEngine::default();
        let k = kernel(1, 256, 0, 8, false);
        let a = core.issue_block(&k, &mut engine, 0).unwrap();
        let b = core.issue_block(&k, &mut engine, 1).unwrap();
        assert_eq!(a.start_thread, 2048 - 256);
        assert_eq!(b.start_thread, 2048 - 512);
        // bottom kernels also take slots from the high end
        assert_eq!(a.slot_id, 31);
        assert_eq!(b.slot_id, 30);
    }

    #[test]
    fn launch_then_release_restores_the_core() {
        let mut core = core();
        let mut engine = SyntheticEngine::default();
        let k = kernel(1, 200, 4096, 4, true);
        let launch = core.issue_block(&k, &mut engine, 0).unwrap();
        assert_eq!(core.num_occupied_blocks(), 1);
        // 200 threads pad to 224
        assert_eq!(core.num_occupied_threads(), 224);
        assert_eq!(core.num_occupied_shared_mem(), 4096);
        assert_eq!(core.num_occupied_registers(), 224 * 16);
        assert_eq!(core.num_running_blocks(1), 1);

        let slot = core.release_block(launch.slot_id);
        assert_eq!(slot.block_id, 0);
        assert_eq!(core.num_occupied_blocks(), 0);
        assert_eq!(core.num_occupied_threads(), 0);
        assert_eq!(core.num_occupied_shared_mem(), 0);
        assert_eq!(core.num_occupied_registers(), 0);
        assert_eq!(core.num_running_blocks(1), 0);
        assert!(!core.thread_occupied(0));
    }

    #[test]
    fn thread_exhaustion_is_a_typed_rejection() {
        let mut core = core();
        let mut engine = SyntheticEngine::default();
        let top = kernel(1, 512, 0, 8, true);
        let bottom = kernel(2, 512, 0, 8, false);
        core.issue_block(&top, &mut engine, 0).unwrap();
        core.issue_block(&bottom, &mut engine, 0).unwrap();
        core.issue_block(&top, &mut engine, 1).unwrap();

        // 1536 of 2048 threads occupied, 1024 requested
        let big = kernel(3, 1024, 0, 1, true);
        let err = core.check_resources(&big).unwrap_err();
        assert_eq!(
            err,
            LaunchError::InsufficientThreads {
                required: 1024,
                free: 512
            }
        );
    }

    #[test]
    fn fragmentation_is_a_typed_rejection() {
        let mut config = config::GPU::default();
        config.max_threads_per_core = 1024;
        let mut core = Core::new(0, Arc::new(config));
        let mut engine = SyntheticEngine::default();
        // 0..256 from the top and 768..1024 from the bottom leave 512 free
        // threads, but a 512 block steps 0, 512 and finds both windows
        // partly occupied
        let top = kernel(1, 256, 0, 8, true);
        let bottom = kernel(2, 256, 0, 8, false);
        core.issue_block(&top, &mut engine, 0).unwrap();
        core.issue_block(&bottom, &mut engine, 0).unwrap();

        let medium = kernel(3, 512, 0, 1, true);
        let err = core.check_resources(&medium).unwrap_err();
        assert_eq!(err, LaunchError::NoContiguousSlot { required: 512 });
    }

    #[test]
    fn shared_memory_budget_is_enforced() {
        let mut core = core();
        let mut engine = SyntheticEngine::default();
        let k = kernel(1, 32, 65536, 4, true);
        core.issue_block(&k, &mut engine, 0).unwrap();
        let err = core.check_resources(&k).unwrap_err();
        assert_eq!(
            err,
            LaunchError::InsufficientSharedMem {
                required: 65536,
                free: 98304 - 65536
            }
        );
    }

    #[test]
    fn block_slot_arena_is_bounded() {
        let mut config = config::GPU::default();
        config.max_concurrent_blocks_per_core = 2;
        let mut core = Core::new(0, Arc::new(config));
        let mut engine = SyntheticEngine::default();
        let k = kernel(1, 32, 0, 8, true);
        core.issue_block(&k, &mut engine, 0).unwrap();
        core.issue_block(&k, &mut engine, 1).unwrap();
        let err = core.issue_block(&k, &mut engine, 2).unwrap_err();
        assert_eq!(err, LaunchError::NoFreeBlockSlot);
    }

    #[test]
    #[should_panic(expected = "release of free block slot")]
    fn releasing_a_free_slot_is_fatal() {
        let mut core = core();
        core.release_block(3);
    }
}
