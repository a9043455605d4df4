use evolver_core::{
    Bin, BranchTraceAgent, Campaign, CertificatePool, CorpusStore, Direction, ExecutionFailure,
    ExecutionMode, ExecutorTimings, FuzzingExecutor, HarnessFailure, MutationStrategy, Mutator,
    Occupancy, OnDiskVectorStore, ProtocolAction, ProtocolEngine, ResultAggregator, Server,
    ServerPool, TestVector, Trace, Transport, UniqueIdAllocator, VectorStore,
};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// A target that handles one connection and is gone by the time anyone checks.
#[derive(Debug)]
struct LoopbackServer {
    id: u32,
    traces_folder: PathBuf,
}

impl Server for LoopbackServer {
    fn id(&self) -> u32 {
        self.id
    }
    fn endpoint(&self) -> &str {
        "loopback"
    }
    fn traces_folder(&self) -> &Path {
        &self.traces_folder
    }
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn restart(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn exited(&self) -> bool {
        true
    }
}

/// Plays the instrumented target: every payload received becomes an edge
/// `first-byte:length`, and a payload starting with `BAD` crashes it.
struct TracingTransport {
    trace_output: PathBuf,
}

impl Transport for TracingTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trace_output)?;
        if bytes.starts_with(b"BAD") {
            return file.write_all(b"CRASH\n");
        }
        let first = bytes.first().copied().unwrap_or_default();
        writeln!(file, "{}:{}", first, bytes.len())
    }
    fn receive(&mut self) -> io::Result<Vec<u8>> {
        Ok(b"ok".to_vec())
    }
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct TracingEngine;

impl ProtocolEngine for TracingEngine {
    fn connect(
        &self,
        server: &dyn Server,
        _mode: ExecutionMode,
    ) -> Result<Box<dyn Transport>, HarnessFailure> {
        Ok(Box::new(TracingTransport {
            trace_output: server.trace_output(),
        }))
    }

    fn execute(
        &self,
        vector: &mut TestVector,
        transport: &mut dyn Transport,
    ) -> Result<(), ExecutionFailure> {
        for (index, action) in vector.trace.actions.iter_mut().enumerate() {
            let outcome = match action.direction {
                Direction::Send => transport.send(&action.payload),
                Direction::Receive => transport.receive().map(|reply| {
                    action.recorded = Some(reply);
                }),
            };
            outcome.map_err(|e| ExecutionFailure {
                action: index,
                reason: e.to_string(),
            })?;
            action.executed = true;
        }
        Ok(())
    }
}

struct Setup {
    store: Arc<OnDiskVectorStore>,
    pool: Arc<ServerPool>,
    aggregator: Arc<ResultAggregator>,
    campaign: Campaign,
    corpus: CorpusStore,
}

fn setup(root: &Path, servers: u32, workers: usize) -> Setup {
    let store = Arc::new(OnDiskVectorStore::new(&root.join("corpus"), None).unwrap());
    let corpus = CorpusStore::new(
        Arc::clone(&store) as Arc<dyn VectorStore>,
        Arc::new(UniqueIdAllocator::new()),
    );
    let pool = Arc::new(ServerPool::with_acquire_timeout(Duration::from_secs(5)));
    for id in 0..servers {
        pool.register(Arc::new(LoopbackServer {
            id,
            traces_folder: root.join("traces"),
        }));
    }
    let aggregator = Arc::new(ResultAggregator::new(corpus.clone()));
    let executor = Arc::new(FuzzingExecutor::new(
        Arc::clone(&pool),
        Arc::new(TracingEngine),
        Arc::new(BranchTraceAgent::new()),
        Arc::clone(&aggregator),
        ExecutorTimings {
            retry_interval: Duration::from_millis(1),
            exit_timeout: Duration::from_millis(100),
            ..ExecutorTimings::default()
        },
    ));
    let campaign = Campaign::start(executor, Arc::clone(&aggregator), workers).unwrap();
    Setup {
        store,
        pool,
        aggregator,
        campaign,
        corpus,
    }
}

fn seed(payload: &[u8]) -> TestVector {
    TestVector {
        trace: Trace::new(vec![
            ProtocolAction::send("ClientHello", payload.to_vec()),
            ProtocolAction::receive("ServerHello"),
        ]),
        ..TestVector::default()
    }
}

#[test]
fn structural_campaign_grows_the_corpus() {
    let dir = tempdir().unwrap();
    let Setup {
        store,
        pool,
        aggregator,
        campaign,
        corpus,
    } = setup(dir.path(), 2, 3);
    corpus.add(Bin::Good, &seed(b"hello")).unwrap();

    let mut mutator = Mutator::new(
        MutationStrategy::Structural,
        corpus,
        CertificatePool::default(),
        ExecutionMode::ALL.to_vec(),
        ChaCha8Rng::seed_from_u64(11),
    );
    for _ in 0..30 {
        campaign.submit(mutator.next_candidate()).unwrap();
    }
    let stats = campaign.drain().unwrap();

    assert_eq!(stats.total, 30);
    assert_eq!(
        stats.good + stats.archive + stats.crash + stats.faulty,
        stats.total
    );
    assert_eq!(stats.faulty, 0);
    assert!(stats.good >= 1, "mutations never reached new edges");
    assert_eq!(store.len(Bin::Good).unwrap() as u64, stats.good + 1);
    assert_eq!(store.len(Bin::Archive).unwrap() as u64, stats.archive);
    assert_eq!(store.len(Bin::Faulty).unwrap(), 0);
    assert_eq!(aggregator.statistics(), stats);
    assert!(pool.occupancy().iter().all(|(_, s)| *s != Occupancy::Reserved));
    assert_eq!(std::fs::read_dir(dir.path().join("traces")).unwrap().count(), 0);
}

#[test]
fn crashing_input_is_kept_and_counted_once() {
    let dir = tempdir().unwrap();
    let Setup {
        store,
        campaign,
        corpus,
        ..
    } = setup(dir.path(), 1, 2);
    corpus.add(Bin::Good, &seed(b"BAD")).unwrap();

    let mut mutator = Mutator::new(
        MutationStrategy::None,
        corpus,
        CertificatePool::default(),
        vec![ExecutionMode::Stream],
        ChaCha8Rng::seed_from_u64(5),
    );
    for _ in 0..6 {
        campaign.submit(mutator.next_candidate()).unwrap();
    }
    let stats = campaign.drain().unwrap();

    assert_eq!(stats.crash, 6);
    assert_eq!(stats.unique_crashes, 1);
    assert_eq!(store.len(Bin::Crash).unwrap(), 6);
    assert_eq!(store.len(Bin::Good).unwrap(), 1);
    let name = &store.list(Bin::Crash).unwrap()[0];
    assert_eq!(store.load(Bin::Crash, name).unwrap(), seed(b"BAD"));
}
