use evolver_core::agent::BranchTraceAgent;
use evolver_core::aggregator::ResultAggregator;
use evolver_core::campaign::{Campaign, CampaignError};
use evolver_core::config::EvolverConfig;
use evolver_core::corpus::{CorpusStore, OnDiskVectorStore};
use evolver_core::engine::SocketEngine;
use evolver_core::executor::FuzzingExecutor;
use evolver_core::ids::UniqueIdAllocator;
use evolver_core::mutator::Mutator;
use evolver_core::pool::ServerPool;
use evolver_core::server::CommandServer;

use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(short, long)]
    workers: Option<usize>,
    /// Used when `RUST_LOG` is not set.
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

fn load_config(cli: &Cli) -> Result<EvolverConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            EvolverConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "loading default configuration");
                EvolverConfig::load_from_file(&default_config_path)?
            } else {
                info!("no config file found, using built-in defaults");
                EvolverConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if let Some(workers) = cli.workers {
        config.fuzzer.workers = workers;
    }
    Ok(config)
}

fn campaign_seed(config: &EvolverConfig) -> u64 {
    config.fuzzer.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default()
    })
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = load_config(&cli)?;
    tracing::debug!(?config, "effective configuration");

    if config.servers.count > 0 && config.servers.command.is_empty() {
        anyhow::bail!("No server command configured; set `command` in the [servers] section");
    }

    let store = OnDiskVectorStore::new(
        &config.corpus.output_folder,
        config.corpus.archive_folder.as_deref(),
    )?;
    let first_id = store.highest_id()?.map_or(0, |id| id + 1);
    let corpus = CorpusStore::new(
        Arc::new(store),
        Arc::new(UniqueIdAllocator::starting_at(first_id)),
    );

    let pool = Arc::new(ServerPool::with_acquire_timeout(
        config.timing.acquire_timeout(),
    ));
    for id in 0..config.servers.count {
        let server = CommandServer::new(id, config.servers.command_server_config(id)?);
        pool.register(Arc::new(server));
    }
    if config.fuzzer.workers > pool.len() {
        warn!(
            workers = config.fuzzer.workers,
            servers = pool.len(),
            "more workers than servers; workers will wait for free servers"
        );
    }

    let aggregator = Arc::new(ResultAggregator::new(corpus.clone()));
    let executor = Arc::new(FuzzingExecutor::new(
        pool,
        Arc::new(SocketEngine::new(config.timing.io_timeout())),
        Arc::new(BranchTraceAgent::new()),
        Arc::clone(&aggregator),
        config.timing.executor_timings(),
    ));
    let campaign = Campaign::start(executor, Arc::clone(&aggregator), config.fuzzer.workers)?;

    let seed = campaign_seed(&config);
    info!(seed, mutator = ?config.fuzzer.mutator, "seeding mutator");
    let mut mutator = Mutator::new(
        config.fuzzer.mutator,
        corpus,
        config.certificates.pool(),
        config.fuzzer.modes.clone(),
        ChaCha8Rng::seed_from_u64(seed),
    );

    let max_iterations = config.fuzzer.max_iterations;
    info!(max_iterations, first_id, "starting fuzz loop");
    let start_time = Instant::now();
    for i in 0..max_iterations {
        if let Err(e) = campaign.submit(mutator.next_candidate()) {
            error!(iteration = i, error = %e, "stopping intake");
            break;
        }

        if i > 0 && i % (max_iterations / 100).max(1) == 0 {
            let stats = campaign.statistics();
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = if elapsed > 0.0 {
                stats.total as f32 / elapsed
            } else {
                0.0
            };
            info!(
                iteration = i,
                total = stats.total,
                good = stats.good,
                archive = stats.archive,
                crash = stats.crash,
                faulty = stats.faulty,
                exec_per_sec = %format!("{exec_per_sec:.2}"),
                "progress"
            );
        }
    }

    let stats = match campaign.drain() {
        Ok(stats) => stats,
        Err(CampaignError::Fatal(e)) => {
            error!(error = %e, "campaign stopped");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    info!(elapsed = ?start_time.elapsed(), "fuzz loop finished");
    println!("{}", stats.to_json()?);

    Ok(())
}
