use crate::kernel::Kernel;
use crate::sync::{Arc, Mutex};
use crate::config;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LaunchError {
    #[error("limit of {max_concurrent_kernels} concurrent kernels reached")]
    LimitReached { max_concurrent_kernels: usize },

    #[error("block size of {threads_per_block} threads too large (limit is {max_threads_per_block} threads per block)")]
    BlockSizeTooLarge {
        threads_per_block: usize,
        max_threads_per_block: usize,
    },

    #[error("launch window blocked for {cycles_left} more cycles")]
    LaunchWindowBlocked { cycles_left: u64 },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RetireError {
    #[error("kernel {kernel_id} is not in the admission table")]
    UnknownKernel { kernel_id: u64 },
}

/// Bounded admission table and kernel selection.
///
/// Admitted kernels occupy fixed slots; slot order is the tie-break order for
/// quota assignment and round-robin selection, so admission order is
/// scheduling order.
#[derive(Debug)]
pub struct KernelManager {
    running_kernels: Box<[Option<Arc<Kernel>>]>,
    last_issued_kernel: Mutex<usize>,
    /// Cycles left in the post-launch window during which no further kernel
    /// may be admitted.
    blocked_launch_cycles: u64,
    total_blocks_launched: u64,
    pub config: Arc<config::GPU>,
}

impl KernelManager {
    #[must_use]
    pub fn new(config: Arc<config::GPU>) -> Self {
        let running_kernels = vec![None; config.max_concurrent_kernels].into_boxed_slice();
        Self {
            running_kernels,
            last_issued_kernel: Mutex::new(0),
            blocked_launch_cycles: 0,
            total_blocks_launched: 0,
            config,
        }
    }

    pub fn running_kernels(&self) -> &[Option<Arc<Kernel>>] {
        &self.running_kernels
    }

    pub fn num_running_kernels(&self) -> usize {
        self.running_kernels
            .iter()
            .flatten()
            .filter(|k| !k.done())
            .count()
    }

    pub fn can_start_kernel(&self) -> bool {
        if self.blocked_launch_cycles != 0 || self.hit_max_block_count() {
            return false;
        }
        self.running_kernels
            .iter()
            .any(|slot| match slot {
                Some(kernel) => kernel.done(),
                None => true,
            })
    }

    /// Admit a kernel into the first free slot.
    pub fn try_launch_kernel(
        &mut self,
        kernel: Arc<Kernel>,
        cycle: u64,
    ) -> Result<(), LaunchError> {
        let threads_per_block = kernel.config().threads_per_block;
        let max_threads_per_block = self.config.max_threads_per_core;
        if threads_per_block > max_threads_per_block {
            return Err(LaunchError::BlockSizeTooLarge {
                threads_per_block,
                max_threads_per_block,
            });
        }

        if self.blocked_launch_cycles != 0 {
            return Err(LaunchError::LaunchWindowBlocked {
                cycles_left: self.blocked_launch_cycles,
            });
        }

        let max_concurrent_kernels = self.running_kernels.len();
        let free_slot = self
            .running_kernels
            .iter_mut()
            .find(|slot| slot.as_ref().map_or(true, |k| k.done()))
            .ok_or(LaunchError::LimitReached {
                max_concurrent_kernels,
            })?;

        log::debug!("launching kernel {kernel} in cycle {cycle}");
        kernel.set_started(cycle);

        self.blocked_launch_cycles = self.config.kernel_launch_delay;
        *free_slot = Some(kernel);
        Ok(())
    }

    /// Back out an admission that did not complete.
    ///
    /// Frees the kernel's slot and reopens the launch window; the kernel was
    /// never scheduled, so nothing else references it.
    pub fn rollback_launch(&mut self, kernel_id: u64) {
        for slot in self.running_kernels.iter_mut() {
            if slot.as_ref().map_or(false, |k| k.id() == kernel_id) {
                log::debug!("rolled back admission of kernel {kernel_id}");
                *slot = None;
                self.blocked_launch_cycles = 0;
                return;
            }
        }
    }

    /// Remove a finished kernel from its slot.
    pub fn retire(&mut self, kernel_id: u64, cycle: u64) -> Result<Arc<Kernel>, RetireError> {
        let slot = self
            .running_kernels
            .iter_mut()
            .find(|slot| slot.as_ref().map_or(false, |k| k.id() == kernel_id))
            .ok_or(RetireError::UnknownKernel { kernel_id })?;
        let kernel = slot.take().unwrap();
        kernel.set_completed(cycle);
        log::debug!(
            "kernel {kernel} retired in cycle {cycle} ({:?} elapsed cycles)",
            kernel.elapsed_cycles()
        );
        Ok(kernel)
    }

    /// Drain every admitted kernel, finished or not.
    pub fn stop_all(&mut self, cycle: u64) -> Vec<Arc<Kernel>> {
        let mut stopped = Vec::new();
        for slot in self.running_kernels.iter_mut() {
            if let Some(kernel) = slot.take() {
                kernel.set_completed(cycle);
                stopped.push(kernel);
            }
        }
        stopped
    }

    pub fn decrement_launch_delay(&mut self, cycles: u64) {
        self.blocked_launch_cycles = self.blocked_launch_cycles.saturating_sub(cycles);
    }

    pub fn increment_launched_blocks(&mut self) {
        self.total_blocks_launched += 1;
    }

    pub fn total_blocks_launched(&self) -> u64 {
        self.total_blocks_launched
    }

    /// Global issued-block ceiling reached.
    pub fn hit_max_block_count(&self) -> bool {
        match self.config.max_total_blocks {
            Some(max) => self.total_blocks_launched >= max,
            None => false,
        }
    }

    /// Whether this kernel may still issue blocks.
    pub fn kernel_more_blocks_left(&self, kernel: Option<&Arc<Kernel>>) -> bool {
        if self.hit_max_block_count() {
            return false;
        }
        kernel.map_or(false, |k| !k.no_more_blocks_to_run())
    }

    pub fn more_blocks_to_run(&self) -> bool {
        if self.hit_max_block_count() {
            return false;
        }
        self.running_kernels
            .iter()
            .flatten()
            .any(|kernel| !kernel.no_more_blocks_to_run())
    }

    /// Pick the kernel to issue the next block from.
    ///
    /// Sticks with the last issued kernel while it has blocks left, then
    /// round-robins over the slots starting after it.
    pub fn select_kernel(&self) -> Option<Arc<Kernel>> {
        let mut last_issued_kernel = self.last_issued_kernel.lock();

        // issue same kernel again
        if let Some(ref last_kernel) = self.running_kernels[*last_issued_kernel] {
            if self.kernel_more_blocks_left(Some(last_kernel)) {
                return Some(Arc::clone(last_kernel));
            }
        }

        // issue new kernel
        let num_kernels = self.running_kernels.len();
        for n in 0..num_kernels {
            let idx = (n + *last_issued_kernel + 1) % num_kernels;
            if self.kernel_more_blocks_left(self.running_kernels[idx].as_ref()) {
                *last_issued_kernel = idx;
                return self.running_kernels[idx].clone();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{KernelManager, LaunchError, RetireError};
    use crate::config;
    use crate::kernel::{Kernel, Launch, NextBlock};
    use crate::sync::Arc;

    fn kernel(id: u64, num_blocks: u64) -> Arc<Kernel> {
        Arc::new(Kernel::new(Launch {
            name: format!("k{id}"),
            id,
            stream_id: id as usize % 2,
            uid_in_stream: 1,
            threads_per_block: 128,
            num_registers: 16,
            shared_mem_bytes: 0,
            num_blocks,
            allocate_from_top: true,
        }))
    }

    fn manager() -> KernelManager {
        KernelManager::new(Arc::new(config::GPU::default()))
    }

    #[test]
    fn admission_table_is_bounded() {
        let mut mgr = manager();
        let max = mgr.config.max_concurrent_kernels;
        for id in 0..max as u64 {
            mgr.try_launch_kernel(kernel(id, 10), 0).unwrap();
        }
        assert!(!mgr.can_start_kernel());
        let err = mgr.try_launch_kernel(kernel(99, 10), 0).unwrap_err();
        assert_eq!(
            err,
            LaunchError::LimitReached {
                max_concurrent_kernels: max
            }
        );
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        let mut mgr = manager();
        let k = Arc::new(Kernel::new(Launch {
            name: "huge".to_string(),
            id: 1,
            stream_id: 0,
            uid_in_stream: 1,
            threads_per_block: 4096,
            num_registers: 16,
            shared_mem_bytes: 0,
            num_blocks: 1,
            allocate_from_top: true,
        }));
        let err = mgr.try_launch_kernel(k, 0).unwrap_err();
        assert_eq!(
            err,
            LaunchError::BlockSizeTooLarge {
                threads_per_block: 4096,
                max_threads_per_block: 2048
            }
        );
    }

    #[test]
    fn launch_window_blocks_admission() {
        let mut config = config::GPU::default();
        config.kernel_launch_delay = 100;
        let mut mgr = KernelManager::new(Arc::new(config));
        mgr.try_launch_kernel(kernel(1, 10), 0).unwrap();
        assert!(!mgr.can_start_kernel());
        let err = mgr.try_launch_kernel(kernel(2, 10), 10).unwrap_err();
        assert_eq!(err, LaunchError::LaunchWindowBlocked { cycles_left: 100 });
        mgr.decrement_launch_delay(99);
        assert!(!mgr.can_start_kernel());
        mgr.decrement_launch_delay(1);
        assert!(mgr.can_start_kernel());
        mgr.try_launch_kernel(kernel(2, 10), 100).unwrap();
    }

    #[test]
    fn rollback_frees_the_slot_and_the_launch_window() {
        let mut config = config::GPU::default();
        config.kernel_launch_delay = 50;
        let mut mgr = KernelManager::new(Arc::new(config));
        mgr.try_launch_kernel(kernel(1, 10), 0).unwrap();
        assert_eq!(mgr.num_running_kernels(), 1);
        assert!(!mgr.can_start_kernel());
        mgr.rollback_launch(1);
        assert_eq!(mgr.num_running_kernels(), 0);
        assert!(mgr.can_start_kernel());
    }

    #[test]
    fn retire_frees_the_slot() {
        let mut mgr = manager();
        mgr.try_launch_kernel(kernel(1, 10), 0).unwrap();
        assert_eq!(mgr.num_running_kernels(), 1);
        let retired = mgr.retire(1, 50).unwrap();
        assert_eq!(retired.elapsed_cycles(), Some(50));
        assert_eq!(mgr.num_running_kernels(), 0);
        assert_eq!(
            mgr.retire(1, 51),
            Err(RetireError::UnknownKernel { kernel_id: 1 })
        );
    }

    #[test]
    fn selection_sticks_then_round_robins() {
        let mut mgr = manager();
        let a = kernel(1, 2);
        let b = kernel(2, 2);
        mgr.try_launch_kernel(a.clone(), 0).unwrap();
        mgr.try_launch_kernel(b.clone(), 0).unwrap();

        // slot 0 holds a, so it is sticky first
        assert_eq!(mgr.select_kernel().unwrap().id(), 1);
        assert_eq!(mgr.select_kernel().unwrap().id(), 1);

        // drain a, selection moves on to b
        assert!(matches!(a.next_block(), Some(NextBlock::Fresh(0))));
        assert!(matches!(a.next_block(), Some(NextBlock::Fresh(1))));
        assert_eq!(mgr.select_kernel().unwrap().id(), 2);

        // and stays sticky on b
        assert!(matches!(b.next_block(), Some(NextBlock::Fresh(0))));
        assert_eq!(mgr.select_kernel().unwrap().id(), 2);
    }

    #[test]
    fn block_ceiling_stops_all_selection() {
        let mut config = config::GPU::default();
        config.max_total_blocks = Some(2);
        let mut mgr = KernelManager::new(Arc::new(config));
        mgr.try_launch_kernel(kernel(1, 100), 0).unwrap();
        assert!(mgr.more_blocks_to_run());
        assert!(mgr.can_start_kernel());
        mgr.increment_launched_blocks();
        mgr.increment_launched_blocks();
        assert!(mgr.hit_max_block_count());
        assert!(!mgr.more_blocks_to_run());
        assert!(mgr.select_kernel().is_none());
        // the ceiling also closes admission
        assert!(!mgr.can_start_kernel());
    }
}
