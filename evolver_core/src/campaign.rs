use crate::aggregator::{ResultAggregator, Statistics};
use crate::executor::Executor;
use crate::pool::PoolError;
use crate::vector::TestVector;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Fuzzing stopped: {0}")]
    Fatal(#[from] PoolError),

    #[error("Campaign is no longer accepting test vectors")]
    Closed,

    #[error("Could not spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A fixed set of worker threads running submitted vectors through one executor.
///
/// Intake is a bounded queue, so `submit` blocks while every worker is busy
/// and the queue is full. Workers stop on the first fatal pool error; once one
/// is recorded no further vectors are accepted.
pub struct Campaign {
    sender: Option<SyncSender<TestVector>>,
    workers: Vec<JoinHandle<()>>,
    fatal: Arc<Mutex<Option<PoolError>>>,
    aggregator: Arc<ResultAggregator>,
}

impl Campaign {
    pub fn start(
        executor: Arc<dyn Executor>,
        aggregator: Arc<ResultAggregator>,
        workers: usize,
    ) -> Result<Self, CampaignError> {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::sync_channel(workers * 2);
        let receiver = Arc::new(Mutex::new(receiver));
        let fatal = Arc::new(Mutex::new(None));

        let mut campaign = Self {
            sender: Some(sender),
            workers: Vec::with_capacity(workers),
            fatal,
            aggregator,
        };
        for index in 0..workers {
            let executor = Arc::clone(&executor);
            let receiver = Arc::clone(&receiver);
            let fatal = Arc::clone(&campaign.fatal);
            let handle = thread::Builder::new()
                .name(format!("evolver-worker-{index}"))
                .spawn(move || work(index, executor.as_ref(), &receiver, &fatal))?;
            campaign.workers.push(handle);
        }
        info!(workers, "campaign started");
        Ok(campaign)
    }

    /// Queues one fuzzing iteration.
    pub fn submit(&self, vector: TestVector) -> Result<(), CampaignError> {
        if let Some(e) = self.fatal_error() {
            return Err(CampaignError::Fatal(e));
        }
        let sender = self.sender.as_ref().ok_or(CampaignError::Closed)?;
        sender
            .send(vector)
            .map_err(|_| self.fatal_error().map_or(CampaignError::Closed, CampaignError::Fatal))
    }

    pub fn statistics(&self) -> Statistics {
        self.aggregator.statistics()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    fn fatal_error(&self) -> Option<PoolError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stops intake, lets queued and in-flight iterations finish, and
    /// returns the final totals.
    pub fn drain(mut self) -> Result<Statistics, CampaignError> {
        self.shutdown();
        match self.fatal_error() {
            Some(e) => Err(CampaignError::Fatal(e)),
            None => Ok(self.statistics()),
        }
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(worker = %name, "worker thread panicked");
            }
        }
    }
}

impl Drop for Campaign {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(
    index: usize,
    executor: &dyn Executor,
    receiver: &Mutex<Receiver<TestVector>>,
    fatal: &Mutex<Option<PoolError>>,
) {
    loop {
        let next = receiver.lock().unwrap_or_else(|p| p.into_inner()).recv();
        let Ok(vector) = next else {
            break;
        };
        match executor.execute(vector) {
            Ok(status) => debug!(worker = index, ?status, "iteration finished"),
            Err(e) => {
                error!(worker = index, error = %e, "fatal pool error, worker stopping");
                fatal
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get_or_insert(e);
                break;
            }
        }
    }
    debug!(worker = index, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Bin, InMemoryVectorStore};
    use crate::executor::FuzzingExecutor;
    use crate::executor::test_utils::{Harness, fast_timings, harness, succeeding};
    use crate::pool::Occupancy;
    use crate::vector::{ProtocolAction, Trace};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn hello(tag: u8) -> TestVector {
        TestVector {
            trace: Trace::new(vec![ProtocolAction::send("ClientHello", vec![tag])]),
            ..TestVector::default()
        }
    }

    fn campaign_over(
        servers: u32,
        workers: usize,
        traces: &std::path::Path,
    ) -> (Campaign, Arc<FuzzingExecutor>) {
        let Harness { executor, .. } = harness(
            servers,
            traces,
            succeeding(),
            None,
            Arc::new(InMemoryVectorStore::new()),
            fast_timings(),
        );
        let executor = Arc::new(executor);
        let aggregator = Arc::clone(executor.aggregator());
        let campaign = Campaign::start(
            Arc::clone(&executor) as Arc<dyn Executor>,
            aggregator,
            workers,
        )
        .unwrap();
        (campaign, executor)
    }

    #[test]
    fn drained_campaign_reports_every_iteration() {
        let dir = tempdir().unwrap();
        let (campaign, executor) = campaign_over(2, 2, dir.path());
        for tag in 0..5 {
            campaign.submit(hello(tag)).unwrap();
        }
        let stats = campaign.drain().unwrap();

        assert_eq!(stats.total, 5);
        assert_eq!(stats.archive, 5);
        assert_eq!(stats.faulty, 0);
        let corpus = executor.aggregator().corpus();
        assert_eq!(corpus.len(Bin::Archive).unwrap(), 5);
        assert_eq!(corpus.len(Bin::Faulty).unwrap(), 0);
        for (id, state) in executor.pool().occupancy() {
            assert_ne!(state, Occupancy::Reserved, "server {id} still reserved");
        }
    }

    #[test]
    fn more_workers_than_servers_still_completes() {
        let dir = tempdir().unwrap();
        let (campaign, executor) = campaign_over(3, 8, dir.path());
        assert_eq!(campaign.workers(), 8);
        for tag in 0..40 {
            campaign.submit(hello(tag)).unwrap();
        }
        let stats = campaign.drain().unwrap();
        assert_eq!(stats.total, 40);
        assert_eq!(stats.archive, 40);
        assert!(
            executor
                .pool()
                .occupancy()
                .iter()
                .all(|(_, state)| *state != Occupancy::Reserved)
        );
    }

    #[test]
    fn idle_campaign_drains_to_zero() {
        let dir = tempdir().unwrap();
        let (campaign, _executor) = campaign_over(1, 4, dir.path());
        let stats = campaign.drain().unwrap();
        assert_eq!(stats, Statistics::default());
    }

    #[test]
    fn pool_errors_stop_the_campaign() {
        let dir = tempdir().unwrap();
        let (campaign, _executor) = campaign_over(0, 1, dir.path());
        campaign.submit(hello(0)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let rejected = loop {
            match campaign.submit(hello(1)) {
                Err(e) => break e,
                Ok(()) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Ok(()) => panic!("campaign kept accepting work after a fatal error"),
            }
        };
        assert!(matches!(
            rejected,
            CampaignError::Fatal(PoolError::NoServersConfigured)
        ));
        assert!(matches!(
            campaign.drain(),
            Err(CampaignError::Fatal(PoolError::NoServersConfigured))
        ));
    }

    #[test]
    fn statistics_are_readable_while_running() {
        let dir = tempdir().unwrap();
        let (campaign, _executor) = campaign_over(2, 2, dir.path());
        for tag in 0..6 {
            campaign.submit(hello(tag)).unwrap();
        }
        let snapshot = campaign.statistics();
        assert!(snapshot.total <= 6);
        assert_eq!(
            snapshot.good + snapshot.archive + snapshot.crash + snapshot.faulty,
            snapshot.total
        );
        assert_eq!(campaign.drain().unwrap().archive, 6);
    }
}
