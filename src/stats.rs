use serde::{Deserialize, Serialize};

/// Passive scheduler counters.
///
/// Purely observational; nothing reads these to make decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    pub kernels_admitted: u64,
    pub kernels_retired: u64,
    pub blocks_launched: u64,
    pub blocks_resumed: u64,
    pub blocks_retired: u64,
    pub blocks_preempted: u64,
    pub quota_recomputations: u64,
    /// Launches rejected because no contiguous thread range existed even
    /// though aggregate resources sufficed.
    pub no_contiguous_slot_rejections: u64,
    /// Eviction passes aborted because the spanned thread range contained a
    /// foreign tenant.
    pub unsafe_eviction_aborts: u64,
    pub evictions_started: u64,
    pub cycles: u64,
}

impl std::ops::AddAssign for Scheduler {
    fn add_assign(&mut self, other: Self) {
        self.kernels_admitted += other.kernels_admitted;
        self.kernels_retired += other.kernels_retired;
        self.blocks_launched += other.blocks_launched;
        self.blocks_resumed += other.blocks_resumed;
        self.blocks_retired += other.blocks_retired;
        self.blocks_preempted += other.blocks_preempted;
        self.quota_recomputations += other.quota_recomputations;
        self.no_contiguous_slot_rejections += other.no_contiguous_slot_rejections;
        self.unsafe_eviction_aborts += other.unsafe_eviction_aborts;
        self.evictions_started += other.evictions_started;
        self.cycles += other.cycles;
    }
}
