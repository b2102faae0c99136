use crate::core::Core;
use crate::kernel::Kernel;
use crate::sync::Arc;
use itertools::Itertools;

/// Saved execution state of an evicted block.
///
/// The scheduler treats the payload as opaque; the functional engine fills
/// and consumes it. Threads recorded retired stay done when the block is
/// relaunched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptionSnapshot {
    pub kernel_id: u64,
    pub block_id: u64,
    /// Threads the block was launched with.
    pub num_threads: usize,
    pub retired_threads: Vec<bool>,
    pub program_counters: Vec<u64>,
    pub register_state: Vec<u8>,
    pub local_mem: Vec<u8>,
    pub shared_mem: Vec<u8>,
}

impl PreemptionSnapshot {
    #[must_use]
    pub fn new(kernel_id: u64, block_id: u64, num_threads: usize) -> Self {
        Self {
            kernel_id,
            block_id,
            num_threads,
            retired_threads: vec![false; num_threads],
            program_counters: vec![0; num_threads],
            register_state: Vec::new(),
            local_mem: Vec::new(),
            shared_mem: Vec::new(),
        }
    }

    #[must_use]
    pub fn num_retired(&self) -> usize {
        self.retired_threads.iter().filter(|&&r| r).count()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EvictionError {
    #[error("an earlier eviction has not drained yet")]
    PreemptionInProgress,

    #[error("victim kernel {kernel_id} has no blocks on this core")]
    NoVictimBlocks { kernel_id: u64 },

    #[error("all {victim_blocks} victim blocks together do not free enough resources")]
    InsufficientVictim { victim_blocks: usize },

    #[error("hardware thread {hw_thread_id} in the eviction span belongs to kernel {owner}, not victim {victim}")]
    UnsafeEviction {
        hw_thread_id: usize,
        owner: u64,
        victim: u64,
    },
}

/// Outcome of the per-core candidate/victim scan.
#[derive(Debug, Default)]
pub struct PreemptionScan {
    pub victim: Option<Arc<Kernel>>,
    pub candidate: Option<Arc<Kernel>>,
    /// A victim above quota is always eviction-eligible, whether or not a
    /// candidate currently needs the space.
    pub found_victim: bool,
}

impl Core {
    /// Scan the admission slots for the first under-quota kernel that still
    /// has blocks (the candidate) and the first over-quota kernel on this
    /// core (the victim).
    ///
    /// A candidate that cannot launch right now gets a pending-preemption
    /// request recorded, to be consumed by the next launch.
    pub fn find_candidate_and_victim(
        &self,
        running_kernels: &[Option<Arc<Kernel>>],
        allow_new_blocks: bool,
    ) -> PreemptionScan {
        let mut scan = PreemptionScan::default();

        for kernel in running_kernels.iter().flatten() {
            if kernel.done() {
                continue;
            }

            let running = self.num_running_blocks(kernel.id());

            if scan.candidate.is_none()
                && allow_new_blocks
                && !kernel.no_more_blocks_to_run()
                && running < kernel.quota()
            {
                scan.candidate = Some(Arc::clone(kernel));
            }

            if scan.victim.is_none() && running > kernel.quota() {
                scan.victim = Some(Arc::clone(kernel));
                scan.found_victim = true;
            }

            if scan.candidate.is_some() && scan.victim.is_some() {
                break;
            }
        }

        if let (Some(victim), Some(candidate)) = (&scan.victim, &scan.candidate) {
            if candidate.more_blocks_than_pending() && self.check_resources(candidate).is_err() {
                candidate.increment_pending_preemptions();
                log::trace!(
                    "core {}: candidate {candidate} under quota but blocked, victim {victim}",
                    self.core_id
                );
            }
        }

        scan
    }

    /// Mark the minimal set of the victim's blocks whose eviction makes one
    /// block of the candidate fit.
    pub fn preempt_for_candidate(
        &mut self,
        victim: &Kernel,
        candidate: &Kernel,
    ) -> Result<Vec<usize>, EvictionError> {
        if self.preemption_in_progress() {
            return Err(EvictionError::PreemptionInProgress);
        }
        let victim_blocks = self.num_running_blocks(victim.id());
        if victim_blocks == 0 {
            return Err(EvictionError::NoVictimBlocks {
                kernel_id: victim.id(),
            });
        }

        let config = self.config();
        let vic_padded = config.threads_per_block_padded(victim.config().threads_per_block);
        let can_padded = config.threads_per_block_padded(candidate.config().threads_per_block);
        let vic_smem = victim.config().shared_mem_bytes;
        let can_smem = candidate.config().shared_mem_bytes;
        let vic_regs = vic_padded * crate::occupancy::rounded_registers(victim.config().num_registers);
        let can_regs = can_padded * crate::occupancy::rounded_registers(candidate.config().num_registers);

        // iteratively grow the victim set until one candidate block fits
        let mut num_blocks = 1;
        while num_blocks <= victim_blocks {
            let fits = self.num_occupied_shared_mem() - num_blocks * vic_smem + can_smem
                < config.shared_memory_size
                && self.num_occupied_registers() - num_blocks * vic_regs + can_regs
                    < config.shader_registers
                && self.num_occupied_threads() - num_blocks * vic_padded + can_padded
                    < config.max_threads_per_core;
            if fits {
                break;
            }
            num_blocks += 1;
        }

        if num_blocks > victim_blocks {
            return Err(EvictionError::InsufficientVictim { victim_blocks });
        }

        self.select_victim_blocks(victim, num_blocks)
    }

    /// Mark every block of the victim above its quota for eviction.
    ///
    /// Used after a quota recomputation shrinks an already running kernel.
    pub fn preempt_quota_excess(&mut self, victim: &Kernel) -> Result<Vec<usize>, EvictionError> {
        if self.preemption_in_progress() {
            return Err(EvictionError::PreemptionInProgress);
        }
        let victim_blocks = self.num_running_blocks(victim.id());
        if victim_blocks == 0 {
            return Err(EvictionError::NoVictimBlocks {
                kernel_id: victim.id(),
            });
        }

        let num_blocks = victim_blocks.saturating_sub(victim.quota());
        if num_blocks == 0 {
            return Ok(Vec::new());
        }

        self.select_victim_blocks(victim, num_blocks)
    }

    /// Pick `num_blocks` of the victim's slots, prove the spanned thread
    /// range is exclusively the victim's, then mark them.
    ///
    /// Top-allocating victims give up their highest slots, bottom-allocating
    /// ones their lowest, so the freed range sits at the contended middle.
    fn select_victim_blocks(
        &mut self,
        victim: &Kernel,
        num_blocks: usize,
    ) -> Result<Vec<usize>, EvictionError> {
        let sorted: Vec<usize> = self
            .blocks_of_kernel(victim.id())
            .iter()
            .copied()
            .sorted_unstable()
            .collect();
        debug_assert!(num_blocks <= sorted.len());

        let selection: Vec<usize> = if victim.config().allocate_from_top {
            sorted[sorted.len() - num_blocks..].to_vec()
        } else {
            sorted[..num_blocks].to_vec()
        };

        let vic_padded = self
            .config()
            .threads_per_block_padded(victim.config().threads_per_block);
        let first = self
            .block_slot(selection[0])
            .expect("victim slot is occupied");
        let last = self
            .block_slot(*selection.last().expect("selection is not empty"))
            .expect("victim slot is occupied");
        let start_tid = first.start_thread;
        let end_tid = last.start_thread + vic_padded;

        // the spanned range may cover threads of slots outside the selection;
        // every occupied thread in it must still belong to the victim
        for tid in start_tid..end_tid {
            if self.thread_occupied(tid) {
                let owner = self
                    .owner_of_thread(tid)
                    .map(|slot| slot.kernel_id)
                    .unwrap_or_else(|| {
                        panic!(
                            "core {}: occupied thread {tid} has no owning block slot",
                            self.core_id
                        )
                    });
                if owner != victim.id() {
                    return Err(EvictionError::UnsafeEviction {
                        hw_thread_id: tid,
                        owner,
                        victim: victim.id(),
                    });
                }
            }
        }

        for &slot_id in &selection {
            let slot = self
                .block_slot_mut(slot_id)
                .expect("victim slot is occupied");
            slot.selected_for_preemption = true;
        }

        log::debug!(
            "core {}: marked {} blocks of {} for eviction (threads {}..{})",
            self.core_id,
            selection.len(),
            victim,
            start_tid,
            end_tid
        );
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::EvictionError;
    use crate::config;
    use crate::core::Core;
    use crate::engine::SyntheticEngine;
    use crate::kernel::{Kernel, Launch};
    use crate::sync::Arc;

    fn kernel(id: u64, threads: usize, num_blocks: u64, from_top: bool) -> Arc<Kernel> {
        Arc::new(Kernel::new(Launch {
            name: format!("k{id}"),
            id,
            stream_id: id as usize % 2,
            uid_in_stream: 1,
            threads_per_block: threads,
            num_registers: 16,
            shared_mem_bytes: 0,
            num_blocks,
            allocate_from_top: from_top,
        }))
    }

    fn slots(kernels: &[&Arc<Kernel>]) -> Vec<Option<Arc<Kernel>>> {
        kernels.iter().map(|k| Some(Arc::clone(k))).collect()
    }

    #[test]
    fn over_quota_kernel_becomes_victim() {
        let mut core = Core::new(0, Arc::new(config::GPU::default()));
        let mut engine = SyntheticEngine::default();
        let a = kernel(1, 256, 100, true);
        let b = kernel(2, 256, 100, false);
        a.set_quota(2);
        b.set_quota(4);
        for cycle in 0..4 {
            core.issue_block(&a, &mut engine, cycle).unwrap();
        }
        let scan = core.find_candidate_and_victim(&slots(&[&a, &b]), true);
        assert_eq!(scan.victim.as_ref().map(|k| k.id()), Some(1));
        assert_eq!(scan.candidate.as_ref().map(|k| k.id()), Some(2));
        assert!(scan.found_victim);
    }

    #[test]
    fn victim_found_even_without_candidate() {
        let mut core = Core::new(0, Arc::new(config::GPU::default()));
        let mut engine = SyntheticEngine::default();
        let a = kernel(1, 256, 100, true);
        a.set_quota(1);
        core.issue_block(&a, &mut engine, 0).unwrap();
        core.issue_block(&a, &mut engine, 1).unwrap();
        // a is also the only possible candidate but it is over quota
        let scan = core.find_candidate_and_victim(&slots(&[&a]), true);
        assert!(scan.found_victim);
        assert!(scan.candidate.is_none());
    }

    #[test]
    fn blocked_candidate_records_a_pending_request() {
        let mut core = Core::new(0, Arc::new(config::GPU::default()));
        let mut engine = SyntheticEngine::default();
        // a fills the whole thread space, b is under quota but cannot launch
        let a = kernel(1, 512, 100, true);
        let b = kernel(2, 512, 100, false);
        a.set_quota(2);
        b.set_quota(2);
        for cycle in 0..4 {
            core.issue_block(&a, &mut engine, cycle).unwrap();
        }
        let scan = core.find_candidate_and_victim(&slots(&[&a, &b]), true);
        assert!(scan.found_victim);
        assert_eq!(scan.candidate.as_ref().map(|k| k.id()), Some(2));
        assert_eq!(b.pending_preemptions(), 1);
    }

    #[test]
    fn minimal_victim_set_grows_until_the_candidate_fits() {
        let mut core = Core::new(0, Arc::new(config::GPU::default()));
        let mut engine = SyntheticEngine::default();
        // 8 blocks of 256 threads fill the core
        let a = kernel(1, 256, 100, true);
        let b = kernel(2, 512, 100, false);
        for cycle in 0..8 {
            core.issue_block(&a, &mut engine, cycle).unwrap();
        }
        // freeing one 256 block leaves 2048-256+512 = 2304 > 2048, freeing
        // two leaves 2048-512+512 = 2048 which still fails the strict check,
        // so three must go
        let marked = core.preempt_for_candidate(&a, &b).unwrap();
        assert_eq!(marked.len(), 3);
        // top-allocating victim gives up its highest slots
        assert_eq!(marked, vec![5, 6, 7]);
        assert!(core.preemption_in_progress());
    }

    #[test]
    fn eviction_is_refused_while_one_is_in_progress() {
        let mut core = Core::new(0, Arc::new(config::GPU::default()));
        let mut engine = SyntheticEngine::default();
        let a = kernel(1, 256, 100, true);
        let b = kernel(2, 512, 100, false);
        for cycle in 0..8 {
            core.issue_block(&a, &mut engine, cycle).unwrap();
        }
        core.preempt_for_candidate(&a, &b).unwrap();
        assert_eq!(
            core.preempt_for_candidate(&a, &b),
            Err(EvictionError::PreemptionInProgress)
        );
    }

    #[test]
    fn foreign_thread_in_span_aborts_without_marking() {
        let mut core = Core::new(0, Arc::new(config::GPU::default()));
        let mut engine = SyntheticEngine::default();
        // a holds 0..64 and 128..192 with b wedged at 64..128, so the span
        // of a's two blocks covers b's threads
        let a = kernel(1, 64, 100, true);
        let b = kernel(2, 64, 100, true);
        core.issue_block(&a, &mut engine, 0).unwrap();
        core.issue_block(&b, &mut engine, 1).unwrap();
        core.issue_block(&a, &mut engine, 2).unwrap();

        a.set_quota(0);
        let err = core.preempt_quota_excess(&a).unwrap_err();
        assert_eq!(
            err,
            EvictionError::UnsafeEviction {
                hw_thread_id: 64,
                owner: 2,
                victim: 1
            }
        );
        // nothing was marked
        assert!(!core.preemption_in_progress());
    }

    #[test]
    fn quota_excess_eviction_takes_only_the_excess() {
        let mut core = Core::new(0, Arc::new(config::GPU::default()));
        let mut engine = SyntheticEngine::default();
        let a = kernel(1, 256, 100, true);
        for cycle in 0..5 {
            core.issue_block(&a, &mut engine, cycle).unwrap();
        }
        a.set_quota(3);
        let marked = core.preempt_quota_excess(&a).unwrap();
        assert_eq!(marked, vec![3, 4]);

        // at or under quota there is nothing to evict
        a.set_quota(5);
        for slot in [3, 4] {
            core.block_slot_mut(slot).unwrap().selected_for_preemption = false;
        }
        assert_eq!(core.preempt_quota_excess(&a), Ok(Vec::new()));
    }
}
