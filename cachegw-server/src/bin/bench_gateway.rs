//! # Gateway Benchmark Harness
//!
//! Purpose: Drive concurrent `get`/`set` traffic through a `CacheGateway` and
//! report throughput and latency quantiles from the gateway's own metrics.
//!
//! Usage: `bench_gateway [target] [tasks] [ops_per_task] [keys] [value_size] [max_connections]`
//! where `target` is `host:port` of a RESP backend or `memory`.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Each task uses a fixed PRNG seed.
//! 2. **Allocation Control**: Keys and values are built before timing starts.
//! 3. **Real Path**: Requests go through admission, the pool and metrics
//!    exactly as HTTP handlers do.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;

use cachegw_client::{ConnectionPool, Connector, MemoryConnector, RespConnector};
use cachegw_common::{OperationKind, Outcome, PoolConfig};
use cachegw_server::{CacheGateway, Metrics};

const DEFAULT_TARGET: &str = "127.0.0.1:6379";
const DEFAULT_TASKS: usize = 100;
const DEFAULT_OPS_PER_TASK: usize = 1_000;
const DEFAULT_KEY_COUNT: usize = 1 << 12;
const DEFAULT_VALUE_SIZE: usize = 128;
const DEFAULT_MAX_CONNECTIONS: usize = 10;

struct BenchConfig {
    target: String,
    tasks: usize,
    ops_per_task: usize,
    key_count: usize,
    key_mask: usize,
    value_size: usize,
    max_connections: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let target = args.next().unwrap_or_else(|| DEFAULT_TARGET.to_string());
        let tasks = parse_usize(args.next(), DEFAULT_TASKS).max(1);
        let ops_per_task = parse_usize(args.next(), DEFAULT_OPS_PER_TASK);
        let key_count = normalize_power_of_two(parse_usize(args.next(), DEFAULT_KEY_COUNT));
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);
        let max_connections = parse_usize(args.next(), DEFAULT_MAX_CONNECTIONS).max(1);

        BenchConfig {
            target,
            tasks,
            ops_per_task,
            key_count,
            key_mask: key_count - 1,
            value_size,
            max_connections,
        }
    }

    fn pool_config(&self) -> Result<PoolConfig> {
        let (host, port) = self
            .target
            .rsplit_once(':')
            .with_context(|| format!("target `{}` is not host:port", self.target))?;
        let port = port
            .parse()
            .with_context(|| format!("invalid port in `{}`", self.target))?;
        Ok(PoolConfig {
            target_host: host.to_string(),
            target_port: port,
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn normalize_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

/// Tiny deterministic PRNG; keeps the key sequence reproducible per task.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

struct Workload {
    keys: Vec<String>,
    value: Vec<u8>,
}

fn report(label: &str, ops: u64, elapsed: Duration, metrics: &Metrics, kind: OperationKind) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let snapshot = metrics.snapshot();
    let latency = snapshot.latency(kind);
    let quantile = |q| {
        latency
            .quantile(q)
            .map(|d| format!("{d:?}"))
            .unwrap_or_else(|| "-".to_string())
    };
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, p50<={}, p99<={}, errors={})",
        quantile(0.5),
        quantile(0.99),
        snapshot.count(kind, Outcome::Error),
    );
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("bench_gateway failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = BenchConfig::from_args();
    if config.target == "memory" {
        let pool_config = PoolConfig {
            max_connections: config.max_connections,
            ..PoolConfig::default()
        };
        bench(MemoryConnector::new(), pool_config, &config).await
    } else {
        let pool_config = config.pool_config()?;
        bench(RespConnector::from_config(&pool_config), pool_config, &config).await
    }
}

async fn bench<C: Connector>(connector: C, pool_config: PoolConfig, config: &BenchConfig) -> Result<()> {
    let pool = ConnectionPool::new(connector, pool_config).context("invalid pool configuration")?;
    pool.preflight().await.context("backend preflight failed")?;
    let gateway = Arc::new(CacheGateway::new(pool, Arc::new(Metrics::new())));

    let workload = Arc::new(Workload {
        keys: (0..config.key_count).map(|i| format!("bench:{i:08}")).collect(),
        value: vec![0x5A; config.value_size],
    });

    println!(
        "target={}, tasks={}, ops/task={}, keys={}, value_size={}, max_connections={}",
        config.target,
        config.tasks,
        config.ops_per_task,
        config.key_count,
        config.value_size,
        config.max_connections
    );

    for kind in [OperationKind::Set, OperationKind::Get] {
        let start = Instant::now();
        let mut tasks = JoinSet::new();
        for task in 0..config.tasks {
            let gateway = gateway.clone();
            let workload = workload.clone();
            let (ops, mask) = (config.ops_per_task, config.key_mask);
            tasks.spawn(async move {
                let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0 ^ task as u64);
                for _ in 0..ops {
                    let key = &workload.keys[rng.next_index(mask)];
                    // Failures are counted by the gateway's metrics.
                    match kind {
                        OperationKind::Get => drop(gateway.get(key).await),
                        OperationKind::Set => drop(gateway.set(key, &workload.value).await),
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                bail!("bench task failed: {err}");
            }
        }
        let ops = (config.tasks * config.ops_per_task) as u64;
        report(kind.as_str(), ops, start.elapsed(), gateway.metrics(), kind);
    }

    let stats = gateway.pool().stats();
    println!(
        "pool: peak_outstanding={}, opened={}, discarded={}, saturated={}, exhausted={}",
        stats.peak_outstanding, stats.opened, stats.discarded, stats.saturated, stats.exhausted
    );

    gateway.stop_admission();
    gateway.wait_idle().await;
    gateway.pool().drain().await;
    Ok(())
}
