#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod config;
pub mod core;
pub mod engine;
pub mod kernel;
pub mod kernel_manager;
pub mod occupancy;
pub mod preemption;
pub mod quota;
pub mod stats;
pub mod sync;

use crate::sync::{Arc, Mutex};
use console::style;
use engine::{CachePartition, FunctionalEngine};
use kernel::Kernel;
use kernel_manager::KernelManager;
use preemption::EvictionError;

/// Upper bound on hardware threads per core, sizing the thread bitmaps.
pub const MAX_THREADS_PER_CORE: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Admission(#[from] kernel_manager::LaunchError),

    #[error(transparent)]
    Quota(#[from] quota::QuotaError),
}

#[derive(thiserror::Error, Debug)]
#[error("no forward progress after {max_cycles} cycles")]
pub struct DeadlockError {
    pub max_cycles: u64,
}

/// The concurrent-kernel scheduler driving a set of cores.
///
/// Owns admission, quota recomputation, per-core block issue and the
/// eviction protocol. Functional execution and the cache hierarchy sit
/// behind the two collaborator traits.
pub struct Simulator<E, C> {
    config: Arc<config::GPU>,
    pub kernel_manager: KernelManager,
    cores: Vec<core::Core>,
    last_core_issue: Mutex<usize>,
    pub engine: E,
    pub cache_partition: C,
    pub stats: stats::Scheduler,
}

impl<E, C> std::fmt::Debug for Simulator<E, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("num_cores", &self.cores.len())
            .field("running_kernels", &self.kernel_manager.num_running_kernels())
            .finish()
    }
}

impl<E, C> Simulator<E, C>
where
    E: FunctionalEngine,
    C: CachePartition,
{
    #[must_use]
    pub fn new(config: Arc<config::GPU>, engine: E, cache_partition: C) -> Self {
        let cores = (0..config.total_cores())
            .map(|core_id| core::Core::new(core_id, Arc::clone(&config)))
            .collect();
        Self {
            kernel_manager: KernelManager::new(Arc::clone(&config)),
            cores,
            last_core_issue: Mutex::new(config.total_cores().saturating_sub(1)),
            engine,
            cache_partition,
            stats: stats::Scheduler::default(),
            config,
        }
    }

    pub fn cores(&self) -> &[core::Core] {
        &self.cores
    }

    /// Admit a kernel and recompute the quota split.
    ///
    /// A kernel no quota split can fit (not even one block) is rolled back
    /// out of the admission table; it must not hold a slot it can never use.
    /// The failed recomputation commits nothing, so the previous split stays
    /// in force.
    pub fn launch(&mut self, kernel: Arc<Kernel>, cycle: u64) -> Result<(), LaunchError> {
        let kernel_id = kernel.id();
        self.kernel_manager.try_launch_kernel(kernel, cycle)?;
        if self.config.concurrent_kernel_sm {
            if let Err(err) = self.recompute_quotas() {
                self.kernel_manager.rollback_launch(kernel_id);
                return Err(err.into());
            }
        }
        self.stats.kernels_admitted += 1;
        Ok(())
    }

    fn recompute_quotas(&mut self) -> Result<(), quota::QuotaError> {
        let reserved_smem =
            quota::assign_quotas(self.kernel_manager.running_kernels(), &self.config)?;
        self.stats.quota_recomputations += 1;
        if self.config.adaptive_cache_config {
            self.cache_partition.set_shared_memory_split(reserved_smem);
        }
        Ok(())
    }

    /// One scheduler cycle: launch window countdown, then a round-robin
    /// pass over the cores.
    pub fn cycle(&mut self, cycle: u64) {
        self.kernel_manager.decrement_launch_delay(1);

        let num_cores = self.cores.len();
        let last_issue = *self.last_core_issue.lock();
        for i in 0..num_cores {
            let core_id = (i + last_issue + 1) % num_cores;
            if self.tick_core(core_id, cycle) > 0 {
                *self.last_core_issue.lock() = core_id;
            }
        }
        self.stats.cycles += 1;
    }

    /// One cycle of one core: drain pending evictions, scan for a
    /// candidate/victim pair, attempt launches, attempt an eviction.
    pub fn tick_core(&mut self, core_id: usize, cycle: u64) -> usize {
        self.complete_preemptions(core_id, cycle);

        let allow_new_blocks = !self.kernel_manager.hit_max_block_count();
        let scan = self.cores[core_id]
            .find_candidate_and_victim(self.kernel_manager.running_kernels(), allow_new_blocks);

        let mut issued = 0;
        if allow_new_blocks {
            if let Some(kernel) = self.kernel_manager.select_kernel() {
                issued += usize::from(self.try_issue(core_id, &kernel, cycle));
            }
            // a starved under-quota kernel gets a second launch attempt so
            // the sticky selection cannot pin the core to a capped kernel
            if issued == 0 {
                if let Some(ref candidate) = scan.candidate {
                    issued += usize::from(self.try_issue(core_id, candidate, cycle));
                }
            }
        }

        if self.config.concurrent_kernel_sm {
            if let Some(ref victim) = scan.victim {
                self.try_evict(core_id, victim, scan.candidate.as_deref());
            }
        }

        issued
    }

    /// Quota-capped launch attempt of one block on one core.
    fn try_issue(&mut self, core_id: usize, kernel: &Arc<Kernel>, cycle: u64) -> bool {
        if kernel.no_more_blocks_to_run() {
            return false;
        }
        let core = &mut self.cores[core_id];
        if self.config.concurrent_kernel_sm
            && core.num_running_blocks(kernel.id()) >= kernel.quota()
        {
            return false;
        }

        match core.issue_block(kernel, &mut self.engine, cycle) {
            Ok(launch) => {
                self.kernel_manager.increment_launched_blocks();
                self.stats.blocks_launched += 1;
                if launch.resumed {
                    self.stats.blocks_resumed += 1;
                }
                true
            }
            Err(core::LaunchError::NoContiguousSlot { .. }) => {
                self.stats.no_contiguous_slot_rejections += 1;
                false
            }
            Err(err) => {
                log::trace!("core {core_id}: cannot issue block of {kernel}: {err}");
                false
            }
        }
    }

    fn try_evict(&mut self, core_id: usize, victim: &Kernel, candidate: Option<&Kernel>) {
        let core = &mut self.cores[core_id];
        let result = match candidate {
            Some(candidate) => core.preempt_for_candidate(victim, candidate),
            None => core.preempt_quota_excess(victim),
        };
        match result {
            Ok(marked) if !marked.is_empty() => {
                self.stats.evictions_started += 1;
            }
            Ok(_) => {}
            Err(EvictionError::UnsafeEviction {
                hw_thread_id,
                owner,
                victim,
            }) => {
                self.stats.unsafe_eviction_aborts += 1;
                log::error!(
                    "{}",
                    style(format!(
                        "core {core_id}: eviction of kernel {victim} aborted, thread {hw_thread_id} belongs to kernel {owner}"
                    ))
                    .red()
                );
            }
            Err(err) => {
                log::trace!("core {core_id}: no eviction of {victim}: {err}");
            }
        }
    }

    /// Snapshot and release every block marked for eviction on this core.
    fn complete_preemptions(&mut self, core_id: usize, cycle: u64) {
        let marked: Vec<usize> = self.cores[core_id]
            .block_slots()
            .filter(|(_, slot)| slot.selected_for_preemption)
            .map(|(slot_id, _)| slot_id)
            .collect();

        for slot_id in marked {
            let Some(slot) = self.cores[core_id].block_slot(slot_id) else {
                continue;
            };
            let (kernel_id, block_id, start_thread) =
                (slot.kernel_id, slot.block_id, slot.start_thread);

            if let Some(kernel) = self.kernel_by_id(kernel_id) {
                let threads = start_thread..start_thread + kernel.config().threads_per_block;
                let snapshot = self
                    .engine
                    .snapshot_block(core_id, threads, &kernel, block_id);
                kernel.push_preempted(snapshot);
                self.cores[core_id].release_block(slot_id);
                kernel.decrement_running_blocks();
                self.stats.blocks_preempted += 1;
                log::debug!(
                    "core {core_id}: evicted block {block_id} of {kernel} in cycle {cycle}"
                );
            } else {
                // kernel was torn down externally, just free the slot
                self.cores[core_id].release_block(slot_id);
            }
        }
    }

    fn kernel_by_id(&self, kernel_id: u64) -> Option<Arc<Kernel>> {
        self.kernel_manager
            .running_kernels()
            .iter()
            .flatten()
            .find(|kernel| kernel.id() == kernel_id)
            .cloned()
    }

    /// A block finished all its threads.
    pub fn notify_block_retired(&mut self, core_id: usize, slot_id: usize, cycle: u64) {
        let slot = self.cores[core_id].release_block(slot_id);
        self.stats.blocks_retired += 1;
        if let Some(kernel) = self.kernel_by_id(slot.kernel_id) {
            kernel.decrement_running_blocks();
            if kernel.done() {
                self.notify_kernel_done(slot.kernel_id, cycle);
            }
        }
    }

    /// A kernel finished its last block; retire it and redistribute quota.
    pub fn notify_kernel_done(&mut self, kernel_id: u64, cycle: u64) {
        match self.kernel_manager.retire(kernel_id, cycle) {
            Ok(_) => {
                self.stats.kernels_retired += 1;
                if self.config.concurrent_kernel_sm {
                    if let Err(err) = self.recompute_quotas() {
                        log::error!("quota recomputation after retiring {kernel_id}: {err}");
                    }
                }
            }
            Err(err) => {
                debug_assert!(false, "{err}");
                log::error!("{err}");
            }
        }
    }

    /// Tear down every running kernel and free their blocks.
    pub fn stop_all(&mut self, cycle: u64) {
        let stopped = self.kernel_manager.stop_all(cycle);
        for kernel in &stopped {
            for core in &mut self.cores {
                let slots: Vec<usize> = core.blocks_of_kernel(kernel.id()).to_vec();
                for slot_id in slots {
                    core.release_block(slot_id);
                    kernel.decrement_running_blocks();
                }
            }
        }
        log::debug!("stopped {} kernels in cycle {cycle}", stopped.len());
    }

    /// Drive the scheduler with a fixed synthetic block latency until all
    /// admitted kernels retire.
    ///
    /// Blocks complete `block_latency` cycles after launch unless they were
    /// evicted in the meantime.
    pub fn run_to_completion(
        &mut self,
        block_latency: u64,
        max_cycles: u64,
    ) -> Result<u64, DeadlockError> {
        let mut cycle = 0;
        // (retire cycle, core, slot, kernel, block)
        let mut in_flight: Vec<(u64, usize, usize, u64, u64)> = Vec::new();

        while self.kernel_manager.num_running_kernels() > 0 {
            if cycle >= max_cycles {
                return Err(DeadlockError { max_cycles });
            }

            let launched_before = self.stats.blocks_launched;
            self.cycle(cycle);

            if self.stats.blocks_launched > launched_before {
                for core in &self.cores {
                    for (slot_id, slot) in core.block_slots() {
                        let tracked = in_flight.iter().any(|&(_, c, s, k, b)| {
                            c == core.core_id
                                && s == slot_id
                                && k == slot.kernel_id
                                && b == slot.block_id
                        });
                        if !tracked {
                            in_flight.push((
                                cycle + block_latency,
                                core.core_id,
                                slot_id,
                                slot.kernel_id,
                                slot.block_id,
                            ));
                        }
                    }
                }
            }

            let due: Vec<(u64, usize, usize, u64, u64)> = in_flight
                .iter()
                .filter(|&&(retire_cycle, ..)| retire_cycle <= cycle)
                .copied()
                .collect();
            in_flight.retain(|&(retire_cycle, ..)| retire_cycle > cycle);

            for (_, core_id, slot_id, kernel_id, block_id) in due {
                // the slot may have been re-assigned by an eviction
                let still_there = self.cores[core_id]
                    .block_slot(slot_id)
                    .map_or(false, |slot| {
                        slot.kernel_id == kernel_id
                            && slot.block_id == block_id
                            && !slot.selected_for_preemption
                    });
                if still_there {
                    self.notify_block_retired(core_id, slot_id, cycle);
                }
            }

            cycle += 1;
        }
        Ok(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::Simulator;
    use crate::config;
    use crate::engine::{RecordingCachePartition, SyntheticEngine};
    use crate::kernel::{Kernel, Launch};
    use crate::sync::Arc;
    use pretty_assertions_sorted::assert_eq;

    fn kernel(
        id: u64,
        stream_id: usize,
        threads: usize,
        smem: usize,
        num_blocks: u64,
    ) -> Arc<Kernel> {
        Arc::new(Kernel::new(Launch {
            name: format!("k{id}"),
            id,
            stream_id,
            uid_in_stream: 1,
            threads_per_block: threads,
            num_registers: 32,
            shared_mem_bytes: smem,
            num_blocks,
            allocate_from_top: stream_id % 2 == 0,
        }))
    }

    fn simulator(config: config::GPU) -> Simulator<SyntheticEngine, RecordingCachePartition> {
        Simulator::new(
            Arc::new(config),
            SyntheticEngine::default(),
            RecordingCachePartition::default(),
        )
    }

    #[test]
    fn single_kernel_runs_to_completion() {
        let mut config = config::GPU::default();
        config.num_simt_clusters = 2;
        let mut sim = simulator(config);
        let k = kernel(1, 0, 256, 0, 32);
        sim.launch(Arc::clone(&k), 0).unwrap();
        sim.run_to_completion(10, 10_000).unwrap();
        assert!(k.done());
        assert_eq!(sim.stats.kernels_retired, 1);
        assert_eq!(sim.stats.blocks_retired, 32);
        assert_eq!(sim.stats.blocks_launched, 32);
    }

    #[test]
    fn two_kernels_share_the_cores_and_finish() {
        let mut config = config::GPU::default();
        config.num_simt_clusters = 2;
        let mut sim = simulator(config);
        let a = kernel(1, 0, 256, 4096, 24);
        let b = kernel(2, 1, 128, 0, 24);
        sim.launch(Arc::clone(&a), 0).unwrap();
        sim.launch(Arc::clone(&b), 0).unwrap();
        assert!(a.quota() > 0);
        assert!(b.quota() > 0);
        sim.run_to_completion(20, 50_000).unwrap();
        assert!(a.done());
        assert!(b.done());
        assert_eq!(sim.stats.kernels_retired, 2);
        assert_eq!(sim.stats.blocks_retired, 48);
    }

    #[test]
    fn unfittable_kernel_is_rolled_back() {
        let mut config = config::GPU::default();
        config.num_simt_clusters = 1;
        let mut sim = simulator(config);
        let a = kernel(1, 0, 256, 0, 32);
        sim.launch(Arc::clone(&a), 0).unwrap();
        assert_eq!(a.quota(), 8);

        // needs more shared memory than the whole core has
        let b = kernel(2, 1, 256, 200_000, 32);
        let err = sim.launch(Arc::clone(&b), 1).unwrap_err();
        assert!(matches!(err, super::LaunchError::Quota(_)));

        // the admission was undone and the old split still stands
        assert_eq!(sim.kernel_manager.num_running_kernels(), 1);
        assert_eq!(a.quota(), 8);
        assert_eq!(b.quota(), 0);

        sim.run_to_completion(10, 10_000).unwrap();
        assert!(a.done());
        assert_eq!(sim.stats.kernels_admitted, 1);
    }

    #[test]
    fn retirement_redistributes_quota() {
        let mut config = config::GPU::default();
        config.num_simt_clusters = 1;
        let mut sim = simulator(config);
        let a = kernel(1, 0, 256, 0, 1000);
        let b = kernel(2, 1, 256, 0, 1000);
        sim.launch(Arc::clone(&a), 0).unwrap();
        sim.launch(Arc::clone(&b), 0).unwrap();
        // the core splits evenly while both kernels run
        assert_eq!(a.quota(), 4);
        assert_eq!(b.quota(), 4);

        // drain b and retire it
        while b.next_block().is_some() {}
        sim.notify_kernel_done(2, 100);

        // a now owns the whole core again
        assert_eq!(a.quota(), 8);
        assert_eq!(sim.stats.quota_recomputations, 3);
    }

    #[test]
    fn quota_shrink_evicts_and_resumes_blocks() {
        let mut config = config::GPU::default();
        config.num_simt_clusters = 1;
        let mut sim = simulator(config);
        // a alone owns the core and fills it
        let a = kernel(1, 0, 256, 0, 64);
        sim.launch(Arc::clone(&a), 0).unwrap();
        assert_eq!(a.quota(), 8);
        for cycle in 0..10 {
            sim.cycle(cycle);
        }
        assert_eq!(sim.cores()[0].num_running_blocks(1), 8);

        // b arrives, the split drops a to 4 and it must give blocks back
        let b = kernel(2, 1, 256, 0, 64);
        sim.launch(Arc::clone(&b), 10).unwrap();
        assert_eq!(a.quota(), 4);
        assert_eq!(b.quota(), 4);

        let total = sim.run_to_completion(25, 100_000).unwrap();
        assert!(a.done());
        assert!(b.done());
        assert!(sim.stats.blocks_preempted > 0);
        assert!(sim.stats.blocks_resumed > 0);
        // every dispatched block eventually retired exactly once
        assert_eq!(sim.stats.blocks_retired, 128);
        assert!(total < 100_000);
    }

    #[test]
    fn cache_split_tracks_reserved_shared_memory() {
        let mut config = config::GPU::default();
        config.num_simt_clusters = 1;
        let mut sim = simulator(config);
        // one block fills the thread budget and reserves 32KB
        let k = kernel(1, 0, 2048, 32768, 8);
        sim.launch(Arc::clone(&k), 0).unwrap();
        assert_eq!(sim.cache_partition.reserved_bytes, 32768);
        assert_eq!(sim.cache_partition.updates, 1);
    }
}
