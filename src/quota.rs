use crate::config::{self, SharingPolicy};
use crate::kernel::Kernel;
use crate::occupancy;
use crate::sync::Arc;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QuotaError {
    #[error("policy assigned zero blocks to kernel {kernel_id}")]
    ZeroQuota { kernel_id: u64 },

    #[error("no table entry for stream {stream_id}")]
    MissingTableEntry { stream_id: usize },

    #[error("no lookup table entry for kernel index tuple {key:?}")]
    MissingLutEntry { key: Vec<usize> },
}

/// Working state of one kernel during quota assignment.
#[derive(Debug, Clone)]
struct UsageInfo {
    usage: occupancy::Usage,
    max_usage: f32,
    cta_quota: usize,
    grid_per_core: usize,
    in_play: bool,
}

/// Assign a block quota to every admitted kernel under the configured policy.
///
/// Walks the admission slots in order, so ties and table lookups are
/// deterministic. Returns the total shared memory reserved by the assigned
/// quotas, in bytes, for the cache-split collaborator.
pub fn assign_quotas(
    running: &[Option<Arc<Kernel>>],
    config: &config::GPU,
) -> Result<usize, QuotaError> {
    let kernels: Vec<&Arc<Kernel>> = running
        .iter()
        .flatten()
        .filter(|kernel| !kernel.done())
        .collect();

    let mut infos: Vec<UsageInfo> = kernels
        .iter()
        .map(|kernel| {
            let usage = kernel.usage(config);
            UsageInfo {
                usage,
                max_usage: usage.max_usage(),
                cta_quota: 0,
                grid_per_core: occupancy::grid_per_core(
                    kernel.config().num_blocks,
                    config.total_cores(),
                ),
                in_play: true,
            }
        })
        .collect();

    match &config.sharing_policy {
        SharingPolicy::FixedQuota { blocks_per_stream } => {
            for (kernel, info) in kernels.iter().zip(infos.iter_mut()) {
                let stream_id = kernel.config().stream_id;
                let quota = *blocks_per_stream
                    .get(stream_id)
                    .ok_or(QuotaError::MissingTableEntry { stream_id })?;
                if quota == 0 {
                    return Err(QuotaError::ZeroQuota {
                        kernel_id: kernel.id(),
                    });
                }
                info.cta_quota = quota;
            }
        }
        SharingPolicy::FixedRatio { ratio_per_stream } => {
            for (kernel, info) in kernels.iter().zip(infos.iter_mut()) {
                let stream_id = kernel.config().stream_id;
                let ratio = *ratio_per_stream
                    .get(stream_id)
                    .ok_or(QuotaError::MissingTableEntry { stream_id })?;
                let quota = (ratio / info.max_usage).floor() as usize;
                log::debug!(
                    "fixed ratio: {} ratio={} max_usage={} quota={}",
                    kernel,
                    ratio,
                    info.max_usage,
                    quota
                );
                if quota == 0 {
                    return Err(QuotaError::ZeroQuota {
                        kernel_id: kernel.id(),
                    });
                }
                info.cta_quota = quota;
            }
        }
        SharingPolicy::LookupTable {
            kernels_per_stream,
            quotas,
        } => {
            if kernels.len() > 1 {
                // tuple of 1-based kernel sequence indices, one per stream,
                // wrapping at the stream's kernel count
                let mut key = vec![0; kernels_per_stream.len()];
                for kernel in &kernels {
                    let stream_id = kernel.config().stream_id;
                    let num_in_stream = *kernels_per_stream
                        .get(stream_id)
                        .ok_or(QuotaError::MissingTableEntry { stream_id })?;
                    let mut kidx = kernel.config().uid_in_stream % num_in_stream;
                    if kidx == 0 {
                        kidx = num_in_stream;
                    }
                    key[stream_id] = kidx;
                }
                let entry = quotas
                    .get(&key)
                    .ok_or_else(|| QuotaError::MissingLutEntry { key: key.clone() })?;
                for (kernel, info) in kernels.iter().zip(infos.iter_mut()) {
                    let stream_id = kernel.config().stream_id;
                    let quota = *entry
                        .get(stream_id)
                        .ok_or(QuotaError::MissingTableEntry { stream_id })?;
                    if quota == 0 {
                        return Err(QuotaError::ZeroQuota {
                            kernel_id: kernel.id(),
                        });
                    }
                    info.cta_quota = quota;
                }
            } else if let (Some(kernel), Some(info)) = (kernels.first(), infos.first_mut()) {
                // single kernel: keep an already assigned quota, otherwise
                // give it the whole core
                let mut quota = kernel.quota();
                if quota == 0 {
                    quota = (1.0 / info.max_usage).floor() as usize;
                }
                if quota == 0 {
                    return Err(QuotaError::ZeroQuota {
                        kernel_id: kernel.id(),
                    });
                }
                info.cta_quota = quota;
            }
        }
        SharingPolicy::WaterFilling => {
            water_fill(&mut infos);
            for (kernel, info) in kernels.iter().zip(&infos) {
                if info.cta_quota == 0 {
                    return Err(QuotaError::ZeroQuota {
                        kernel_id: kernel.id(),
                    });
                }
            }
        }
    }

    // every quota validated; commit the whole assignment in one pass so a
    // failed recomputation leaves the previous split fully in force
    let mut total_smem = 0.0;
    for (kernel, info) in kernels.iter().zip(&infos) {
        kernel.set_quota(info.cta_quota);
        log::debug!(
            "stream {} ({}): {} blocks per core",
            kernel.config().stream_id,
            kernel,
            info.cta_quota
        );
        total_smem += info.cta_quota as f32 * info.usage.smem_usage;
    }
    let total_smem_bytes = (total_smem * config.shared_memory_size as f32).ceil() as usize;
    debug_assert!(total_smem_bytes <= config.shared_memory_size);
    Ok(total_smem_bytes)
}

/// Iterative max-min fair water filling.
///
/// Repeatedly grants one block to the kernel whose allocated share
/// (quota x max usage) is lowest, until no kernel can take another block
/// within the four per-core budgets and its per-core grid share. A kernel
/// whose grant fails is out for the rest of the run.
fn water_fill(infos: &mut [UsageInfo]) {
    let mut in_play = infos.iter().filter(|info| info.in_play).count();

    let mut tot_thread = 0.0;
    let mut tot_smem = 0.0;
    let mut tot_reg = 0.0;
    let mut tot_cta = 0.0;

    while in_play > 0 {
        let mut min_usage = 1.0;
        let mut min_k: Option<usize> = None;

        for (idx, info) in infos.iter().enumerate() {
            if info.in_play {
                let current_usage = info.cta_quota as f32 * info.max_usage;
                if current_usage < min_usage {
                    min_usage = current_usage;
                    min_k = Some(idx);
                }
            }
        }

        let Some(min_k) = min_k else {
            break;
        };
        let info = &mut infos[min_k];

        let fits = info.usage.thread_usage + tot_thread <= 1.0
            && info.usage.smem_usage + tot_smem <= 1.0
            && info.usage.reg_usage + tot_reg <= 1.0
            && info.usage.cta_usage + tot_cta <= 1.0
            && info.cta_quota < info.grid_per_core;

        if fits {
            tot_thread += info.usage.thread_usage;
            tot_smem += info.usage.smem_usage;
            tot_reg += info.usage.reg_usage;
            tot_cta += info.usage.cta_usage;
            info.cta_quota += 1;
        } else {
            info.in_play = false;
            in_play -= 1;
        }
    }
}
