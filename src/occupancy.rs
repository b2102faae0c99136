use crate::config;

/// Per-block resource footprint of a kernel, as fractions of one core.
///
/// Each field is the share of the corresponding core resource that a single
/// block of the kernel occupies. Computed once per kernel and cached; the
/// quota policies and the admission checks all work on these fractions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub thread_usage: f32,
    pub smem_usage: f32,
    pub reg_usage: f32,
    pub cta_usage: f32,
}

impl Usage {
    /// The binding dimension: the largest of the four fractions.
    #[must_use]
    pub fn max_usage(&self) -> f32 {
        self.thread_usage
            .max(self.smem_usage)
            .max(self.reg_usage)
            .max(self.cta_usage)
    }
}

/// Per-thread register count as allocated by hardware (multiples of 4).
#[must_use]
pub fn rounded_registers(num_registers: usize) -> usize {
    (num_registers + 3) & !3
}

#[must_use]
pub fn compute(
    config: &config::GPU,
    threads_per_block: usize,
    num_registers: usize,
    shared_mem_bytes: usize,
) -> Usage {
    let padded_threads = config.threads_per_block_padded(threads_per_block);
    Usage {
        thread_usage: padded_threads as f32 / config.max_threads_per_core as f32,
        smem_usage: shared_mem_bytes as f32 / config.shared_memory_size as f32,
        reg_usage: (padded_threads * rounded_registers(num_registers)) as f32
            / config.shader_registers as f32,
        cta_usage: 1.0 / config.max_concurrent_blocks_per_core as f32,
    }
}

/// Blocks of the kernel per core if its grid were spread evenly.
///
/// Upper bound for any quota: assigning more than this wastes slots the
/// kernel can never fill.
#[must_use]
pub fn grid_per_core(num_blocks: u64, num_cores: usize) -> usize {
    let num_cores = num_cores as u64;
    (num_blocks.div_ceil(num_cores)) as usize
}
