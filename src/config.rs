use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Intra-core sharing policy.
///
/// Selects how the per-kernel block quota is derived when multiple kernels
/// share one core. Fixed at configuration time; the tables for the
/// table-driven policies are supplied externally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SharingPolicy {
    /// Quota read directly from a per-stream table.
    FixedQuota { blocks_per_stream: Vec<usize> },
    /// quota = floor(ratio / max_usage), with a per-stream ratio.
    FixedRatio { ratio_per_stream: Vec<f32> },
    /// Quota looked up by the tuple of per-stream kernel sequence indices
    /// (1-based, wrapping at `kernels_per_stream`).
    LookupTable {
        kernels_per_stream: Vec<usize>,
        quotas: HashMap<Vec<usize>, Vec<usize>>,
    },
    /// Iterative max-min fair water filling over the four resource
    /// dimensions (the default).
    WaterFilling,
}

impl SharingPolicy {
    #[must_use]
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::FixedQuota { .. } => PolicyKind::FixedQuota,
            Self::FixedRatio { .. } => PolicyKind::FixedRatio,
            Self::LookupTable { .. } => PolicyKind::LookupTable,
            Self::WaterFilling => PolicyKind::WaterFilling,
        }
    }
}

impl Default for SharingPolicy {
    fn default() -> Self {
        Self::WaterFilling
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum PolicyKind {
    FixedQuota,
    FixedRatio,
    LookupTable,
    WaterFilling,
}

#[derive(Clone, Debug)]
pub struct GPU {
    /// Number of threads per shader core pipeline
    pub max_threads_per_core: usize,
    /// Shader core pipeline warp size
    pub warp_size: usize,
    /// Number of registers per shader core.
    /// Limits number of concurrent CTAs. (default 65536)
    pub shader_registers: usize,
    /// Size of shared memory per shader core (default 96kB)
    pub shared_memory_size: usize,
    /// Maximum number of concurrent CTAs in shader (default 32)
    pub max_concurrent_blocks_per_core: usize,
    /// Number of processing clusters
    pub num_simt_clusters: usize,
    /// Number of simd cores per cluster
    pub num_cores_per_simt_cluster: usize,
    /// Maximum kernels that can run concurrently on the GPU.
    ///
    /// Also bounds the number of kernels sharing one core: quota assignment
    /// walks the admission slots in order.
    pub max_concurrent_kernels: usize,
    /// Support concurrent kernels on a SM (default = enabled)
    pub concurrent_kernel_sm: bool,
    /// How the block quota is split between kernels sharing a core
    pub sharing_policy: SharingPolicy,
    /// Block the next kernel launch for this many cycles after a launch
    pub kernel_launch_delay: u64,
    /// Stop issuing blocks once this many have been launched in total
    pub max_total_blocks: Option<u64>,
    /// Re-derive the shared memory / L1 split after each quota recomputation
    pub adaptive_cache_config: bool,
}

impl Default for GPU {
    fn default() -> Self {
        Self {
            max_threads_per_core: 2048,
            warp_size: 32,
            shader_registers: 65536,
            shared_memory_size: 98304,
            max_concurrent_blocks_per_core: 32,
            num_simt_clusters: 20,
            num_cores_per_simt_cluster: 1,
            max_concurrent_kernels: 8,
            concurrent_kernel_sm: true,
            sharing_policy: SharingPolicy::WaterFilling,
            kernel_launch_delay: 0,
            max_total_blocks: None,
            adaptive_cache_config: true,
        }
    }
}

impl GPU {
    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.num_simt_clusters * self.num_cores_per_simt_cluster
    }

    /// Block size padded to an integral number of warps.
    ///
    /// hw warp id == hw thread id / warp size, so a block always spans whole
    /// hardware warps.
    #[must_use]
    pub fn threads_per_block_padded(&self, threads_per_block: usize) -> usize {
        let warp_size = self.warp_size;
        if threads_per_block % warp_size != 0 {
            ((threads_per_block / warp_size) + 1) * warp_size
        } else {
            threads_per_block
        }
    }

    /// Static occupancy bound for a kernel running alone on a core.
    ///
    /// In non-sharing mode this is the fixed block cap for the kernel's whole
    /// lifetime.
    #[must_use]
    pub fn max_blocks(&self, kernel: &crate::kernel::Kernel) -> usize {
        let usage = kernel.usage(self);
        let by_usage = (1.0 / usage.max_usage()).floor() as usize;
        by_usage.min(self.max_concurrent_blocks_per_core)
    }
}

#[cfg(test)]
mod tests {
    use super::GPU;

    #[test]
    fn block_size_padded_to_warp_multiple() {
        let config = GPU::default();
        assert_eq!(config.threads_per_block_padded(1), 32);
        assert_eq!(config.threads_per_block_padded(32), 32);
        assert_eq!(config.threads_per_block_padded(33), 64);
        assert_eq!(config.threads_per_block_padded(256), 256);
        assert_eq!(config.threads_per_block_padded(1000), 1024);
    }
}
