use crate::agent::{Classification, ExecutionResult};
use crate::corpus::{Bin, CorpusError, CorpusStore};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};

/// Running totals of a campaign.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total: u64,
    pub good: u64,
    pub archive: u64,
    pub crash: u64,
    /// Crashes with distinct trace output.
    pub unique_crashes: u64,
    pub faulty: u64,
    pub timeouts: u64,
    /// Edges discovered across all good results.
    pub new_edges: u64,
}

impl Statistics {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Default)]
struct AggregatorState {
    statistics: Statistics,
    crash_digests: HashSet<String>,
}

/// Thread-safe sink for execution results.
///
/// Every committed result is counted; its vector is filed into the bin that
/// matches its classification, which is what the mutator reads next.
pub struct ResultAggregator {
    corpus: CorpusStore,
    state: Mutex<AggregatorState>,
}

impl ResultAggregator {
    pub fn new(corpus: CorpusStore) -> Self {
        Self {
            corpus,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn corpus(&self) -> &CorpusStore {
        &self.corpus
    }

    /// Records `result`, returning where its vector was stored.
    ///
    /// Counters are updated even when storing fails, so totals always match
    /// the number of commits.
    pub fn commit(&self, result: ExecutionResult) -> Result<Option<PathBuf>, CorpusError> {
        let stored = self.persist(&result);

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let stats = &mut state.statistics;
        stats.total += 1;
        stats.new_edges += result.new_edges as u64;
        if result.timed_out {
            stats.timeouts += 1;
        }
        match result.classification {
            Classification::Good => stats.good += 1,
            Classification::Archive => stats.archive += 1,
            Classification::Faulty => stats.faulty += 1,
            Classification::Crash => stats.crash += 1,
        }
        if result.classification == Classification::Crash {
            let digest = result.crash_digest.clone().unwrap_or_default();
            if state.crash_digests.insert(digest) {
                state.statistics.unique_crashes += 1;
                info!(location = ?stored.as_ref().ok(), "new unique crash");
            }
        }
        drop(state);

        stored.inspect_err(|e| {
            error!(classification = ?result.classification, error = %e, "could not store result");
        })
    }

    fn persist(&self, result: &ExecutionResult) -> Result<Option<PathBuf>, CorpusError> {
        match result.classification {
            // The executor already captured the faulty artifact.
            Classification::Faulty if result.artifact.is_some() => Ok(result.artifact.clone()),
            Classification::Faulty => self.corpus.add(Bin::Faulty, &result.original).map(Some),
            // Crashes keep the exact input that was sent.
            Classification::Crash => self.corpus.add(Bin::Crash, &result.original).map(Some),
            Classification::Good | Classification::Archive => self
                .corpus
                .add(result.classification.bin(), &result.executed)
                .map(Some),
        }
    }

    /// A consistent copy of the current totals.
    pub fn statistics(&self) -> Statistics {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .statistics
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{InMemoryVectorStore, VectorStore};
    use crate::ids::UniqueIdAllocator;
    use crate::vector::{ProtocolAction, TestVector, Trace};
    use std::sync::Arc;
    use std::thread;

    fn aggregator() -> ResultAggregator {
        ResultAggregator::new(CorpusStore::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(UniqueIdAllocator::new()),
        ))
    }

    fn vector(tag: u8) -> TestVector {
        TestVector {
            trace: Trace::new(vec![ProtocolAction::send("ClientHello", vec![tag])]),
            ..TestVector::default()
        }
    }

    fn result(classification: Classification, tag: u8) -> ExecutionResult {
        ExecutionResult::new(classification, vector(tag), vector(tag.wrapping_add(100)))
    }

    #[test]
    fn commits_land_in_matching_bins() {
        let aggregator = aggregator();
        aggregator.commit(result(Classification::Good, 1)).unwrap();
        aggregator.commit(result(Classification::Archive, 2)).unwrap();
        aggregator.commit(result(Classification::Archive, 3)).unwrap();

        let corpus = aggregator.corpus();
        assert_eq!(corpus.len(Bin::Good).unwrap(), 1);
        assert_eq!(corpus.len(Bin::Archive).unwrap(), 2);
        assert_eq!(corpus.len(Bin::Crash).unwrap(), 0);

        let stats = aggregator.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.good, 1);
        assert_eq!(stats.archive, 2);
    }

    #[test]
    fn good_results_store_the_executed_vector() {
        let aggregator = aggregator();
        aggregator.commit(result(Classification::Good, 1)).unwrap();
        let store = aggregator.corpus().store();
        let name = &store.list(Bin::Good).unwrap()[0];
        assert_eq!(store.load(Bin::Good, name).unwrap(), vector(101));
    }

    #[test]
    fn crashes_are_kept_and_deduplicated_by_digest() {
        let aggregator = aggregator();
        for (tag, digest) in [(1, "aa"), (2, "aa"), (3, "bb")] {
            let mut crash = result(Classification::Crash, tag);
            crash.crash_digest = Some(digest.to_string());
            aggregator.commit(crash).unwrap();
        }
        let stats = aggregator.statistics();
        assert_eq!(stats.crash, 3);
        assert_eq!(stats.unique_crashes, 2);

        let store = aggregator.corpus().store();
        assert_eq!(store.len(Bin::Crash).unwrap(), 3);
        let mut stored: Vec<_> = store
            .list(Bin::Crash)
            .unwrap()
            .iter()
            .map(|name| store.load(Bin::Crash, name).unwrap())
            .collect();
        stored.sort_by_key(|v| v.trace.actions[0].payload[0]);
        assert_eq!(stored, vec![vector(1), vector(2), vector(3)]);
    }

    #[test]
    fn faulty_results_with_an_artifact_are_not_stored_twice() {
        let aggregator = aggregator();
        let mut faulty = result(Classification::Faulty, 1);
        faulty.artifact = Some(PathBuf::from("faulty/00000000"));
        let stored = aggregator.commit(faulty).unwrap();
        assert_eq!(stored, Some(PathBuf::from("faulty/00000000")));
        assert_eq!(aggregator.corpus().len(Bin::Faulty).unwrap(), 0);
        assert_eq!(aggregator.statistics().faulty, 1);
    }

    #[test]
    fn timeouts_and_edges_are_counted() {
        let aggregator = aggregator();
        let mut timed_out = result(Classification::Archive, 1);
        timed_out.timed_out = true;
        aggregator.commit(timed_out).unwrap();
        let mut good = result(Classification::Good, 2);
        good.new_edges = 5;
        aggregator.commit(good).unwrap();

        let stats = aggregator.statistics();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.new_edges, 5);
    }

    #[test]
    fn statistics_render_as_json() {
        let aggregator = aggregator();
        aggregator.commit(result(Classification::Good, 1)).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&aggregator.statistics().to_json().unwrap()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["good"], 1);
        assert_eq!(json["unique_crashes"], 0);
    }

    #[test]
    fn concurrent_commits_lose_no_updates() {
        let aggregator = Arc::new(aggregator());
        let classes = [
            Classification::Good,
            Classification::Archive,
            Classification::Crash,
            Classification::Faulty,
        ];
        let workers: Vec<_> = (0..8u8)
            .map(|worker| {
                let aggregator = Arc::clone(&aggregator);
                thread::spawn(move || {
                    for i in 0..100u8 {
                        let class = classes[(usize::from(worker) + usize::from(i)) % 4];
                        aggregator.commit(result(class, i)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = aggregator.statistics();
        assert_eq!(stats.total, 800);
        assert_eq!(stats.good, 200);
        assert_eq!(stats.archive, 200);
        assert_eq!(stats.crash, 200);
        assert_eq!(stats.faulty, 200);
        assert_eq!(
            stats.good + stats.archive + stats.crash + stats.faulty,
            stats.total
        );
        let corpus = aggregator.corpus();
        assert_eq!(corpus.len(Bin::Good).unwrap(), 200);
        assert_eq!(corpus.len(Bin::Archive).unwrap(), 200);
        assert_eq!(corpus.len(Bin::Crash).unwrap(), 200);
        assert_eq!(corpus.len(Bin::Faulty).unwrap(), 200);
    }
}
