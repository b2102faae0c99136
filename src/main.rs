use clap::Parser;
use color_eyre::eyre;
use gpusharesim::engine::{RecordingCachePartition, SyntheticEngine};
use gpusharesim::kernel::{Kernel, Launch};
use gpusharesim::sync::Arc;
use gpusharesim::{config, Simulator};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Number of cores to simulate
    #[arg(short = 'c', long = "cores", default_value = "4")]
    cores: usize,

    /// Quota policy for kernels sharing a core
    #[arg(short = 'p', long = "policy", default_value = "water-filling")]
    policy: config::PolicyKind,

    /// Blocks per grid for each synthetic kernel
    #[arg(short = 'b', long = "blocks", default_value = "256")]
    blocks: u64,

    /// Synthetic block latency in cycles
    #[arg(short = 'l', long = "latency", default_value = "100")]
    block_latency: u64,

    /// Give up after this many cycles
    #[arg(long = "max-cycles", default_value = "10000000")]
    max_cycles: u64,
}

fn sharing_policy(kind: config::PolicyKind) -> config::SharingPolicy {
    match kind {
        config::PolicyKind::FixedQuota => config::SharingPolicy::FixedQuota {
            blocks_per_stream: vec![4, 4],
        },
        config::PolicyKind::FixedRatio => config::SharingPolicy::FixedRatio {
            ratio_per_stream: vec![0.5, 0.5],
        },
        config::PolicyKind::LookupTable => config::SharingPolicy::LookupTable {
            kernels_per_stream: vec![1, 1],
            quotas: [(vec![1, 1], vec![4, 4])].into_iter().collect(),
        },
        config::PolicyKind::WaterFilling => config::SharingPolicy::WaterFilling,
    }
}

/// Two streams of synthetic kernels with different resource shapes
/// contending for the same cores.
fn workload(blocks: u64) -> Vec<Arc<Kernel>> {
    let shapes = [
        ("stencil", 0, 256, 32, 16384),
        ("reduce", 1, 128, 16, 0),
        ("gemm", 0, 512, 64, 32768),
        ("scan", 1, 96, 24, 4096),
    ];
    shapes
        .iter()
        .enumerate()
        .map(|(i, &(name, stream_id, threads, regs, smem))| {
            Arc::new(Kernel::new(Launch {
                name: name.to_string(),
                id: i as u64 + 1,
                stream_id,
                uid_in_stream: i / 2 + 1,
                threads_per_block: threads,
                num_registers: regs,
                shared_mem_bytes: smem,
                num_blocks: blocks,
                allocate_from_top: stream_id % 2 == 0,
            }))
        })
        .collect()
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();

    let config = config::GPU {
        num_simt_clusters: options.cores,
        num_cores_per_simt_cluster: 1,
        sharing_policy: sharing_policy(options.policy),
        ..config::GPU::default()
    };

    let mut sim = Simulator::new(
        Arc::new(config),
        SyntheticEngine::default(),
        RecordingCachePartition::default(),
    );

    let mut cycle = 0;
    for kernel in workload(options.blocks) {
        sim.launch(kernel, cycle)?;
        cycle += 1;
    }

    let cycles = sim.run_to_completion(options.block_latency, options.max_cycles)?;
    log::info!("completed in {cycles} cycles");

    println!("{}", serde_json::to_string_pretty(&sim.stats)?);
    Ok(())
}
