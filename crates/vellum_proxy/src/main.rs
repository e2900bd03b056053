// Vellum proxy node binary.
//
// Runs both server roles against in-process collaborators and drives a
// synthetic get/set workload through them, logging throughput and latency.
// Useful for smoke-testing the pipelines and tuning knobs without a
// surrounding cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use vellum_core::ProxyError;
use vellum_proxy::local::{LocalCluster, LocalClusterConfig};
use vellum_proxy::Knobs;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "vellum-proxy")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Workload(WorkloadArgs),
}

/// CLI options for the single-process workload run.
#[derive(Parser, Debug)]
struct WorkloadArgs {
    /// Number of concurrent client loops.
    #[arg(long, env = "VELLUM_CLIENTS", default_value_t = 8)]
    clients: usize,

    /// Number of hot keys used by the workload.
    #[arg(long, env = "VELLUM_KEYS", default_value_t = 64)]
    keys: usize,

    /// Key prefix. Keys are generated as `{prefix}k{idx}`.
    #[arg(long, env = "VELLUM_KEY_PREFIX", default_value = "vellum_")]
    key_prefix: String,

    /// Percent of transactions that write (rest read).
    #[arg(long, env = "VELLUM_SET_PCT", default_value_t = 50)]
    set_pct: u8,

    /// Total runtime for the workload.
    #[arg(long, env = "VELLUM_DURATION", default_value = "10s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, env = "VELLUM_SEED", default_value_t = 0)]
    seed: u64,

    /// Number of resolvers in the local cluster.
    #[arg(long, env = "VELLUM_RESOLVERS", default_value_t = 2)]
    resolvers: usize,

    /// Commit batch idle-flush interval (seconds).
    #[arg(long, env = "VELLUM_IDLE_FLUSH", default_value_t = 0.05)]
    idle_flush: f64,

    /// MVCC window in versions.
    #[arg(long, env = "VELLUM_MVCC_WINDOW", default_value_t = 5_000_000)]
    mvcc_window: i64,
}

#[derive(Default)]
struct WorkloadTotals {
    transactions: u64,
    reads: u64,
    writes: u64,
    conflicts: u64,
    errors: u64,
    total_latency: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Command::Workload(workload) = args.cmd;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run_workload(workload))
}

async fn run_workload(args: WorkloadArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    tracing::info!(seed, clients = args.clients, "starting local cluster");

    let mut knobs = Knobs::default();
    knobs.max_commit_batch_interval = args.idle_flush.max(0.001);
    knobs.max_read_transaction_life_versions = args.mvcc_window;
    knobs.max_write_transaction_life_versions = args.mvcc_window;

    let cluster = LocalCluster::start(LocalClusterConfig {
        knobs: Arc::new(knobs),
        resolver_count: args.resolvers.max(1),
        ..Default::default()
    })
    .await;

    let deadline = Instant::now() + *args.duration;
    let totals = Arc::new(parking_lot::Mutex::new(WorkloadTotals::default()));

    let mut workers = Vec::new();
    for worker in 0..args.clients.max(1) {
        let client = cluster.client();
        let totals = totals.clone();
        let prefix = args.key_prefix.clone();
        let keys = args.keys.max(1);
        let set_pct = args.set_pct.min(100);
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(worker as u64));

        workers.push(tokio::spawn(async move {
            while Instant::now() < deadline {
                let key = format!("{prefix}k{:04}", rng.gen_range(0..keys));
                let is_write = rng.gen_range(0..100) < set_pct;
                let started = Instant::now();

                let mut txn = client.begin();
                let outcome = if is_write {
                    let value = format!("v{}", rng.gen::<u32>());
                    txn.set(key.as_bytes(), value.as_bytes());
                    txn.commit().await.map(|_| ())
                } else {
                    txn.get(key.as_bytes()).await.map(|_| ())
                };

                let mut t = totals.lock();
                t.transactions += 1;
                t.total_latency += started.elapsed().as_secs_f64();
                match outcome {
                    Ok(()) => {
                        if is_write {
                            t.writes += 1;
                        } else {
                            t.reads += 1;
                        }
                    }
                    Err(ProxyError::NotCommitted { .. }) => t.conflicts += 1,
                    Err(err) => {
                        t.errors += 1;
                        drop(t);
                        tracing::warn!(error = %err, "workload operation failed");
                    }
                }
            }
        }));
    }

    let progress = {
        let totals = totals.clone();
        tokio::spawn(async move {
            let mut last = 0u64;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let t = totals.lock();
                tracing::info!(
                    tps = t.transactions - last,
                    conflicts = t.conflicts,
                    errors = t.errors,
                    "workload progress"
                );
                last = t.transactions;
            }
        })
    };

    for worker in workers {
        worker.await.context("workload worker panicked")?;
    }
    progress.abort();

    let totals = totals.lock();
    let summary = serde_json::json!({
        "seed": seed,
        "transactions": totals.transactions,
        "reads": totals.reads,
        "writes": totals.writes,
        "conflicts": totals.conflicts,
        "errors": totals.errors,
        "mean_latency_ms": if totals.transactions > 0 {
            totals.total_latency / totals.transactions as f64 * 1e3
        } else {
            0.0
        },
        "committed_version": cluster.master.committed_version(),
        "log_pushes": cluster.log.pushes().len(),
        "commit_stats": cluster.commit.data.stats.snapshot(),
        "grv_stats": cluster.grv.data.stats.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&summary).context("serializing summary")?);
    Ok(())
}
