use crate::corpus::Bin;
use crate::server::Server;
use crate::vector::TestVector;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// First trace-output line a target writes when it crashed.
pub const CRASH_MARKER: &str = "CRASH";
/// First trace-output line a target writes when it hit its own time limit.
pub const TIMEOUT_MARKER: &str = "TIMEOUT";

/// The outcome class of one execution. Exactly one per run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Crash,
    /// New behaviour was observed; the vector seeds future mutations.
    Good,
    /// Nothing new happened.
    Archive,
    /// The harness itself failed while executing the vector.
    Faulty,
}

impl Classification {
    /// The corpus bin results of this class are kept in.
    pub const fn bin(&self) -> Bin {
        match self {
            Classification::Crash => Bin::Crash,
            Classification::Good => Bin::Good,
            Classification::Archive => Bin::Archive,
            Classification::Faulty => Bin::Faulty,
        }
    }
}

/// The classified outcome of one fuzzing iteration.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub classification: Classification,
    /// The vector exactly as it was handed to the executor.
    pub original: TestVector,
    /// The vector after the protocol engine ran it.
    pub executed: TestVector,
    /// Faulty artifact captured for this run, if any.
    pub artifact: Option<PathBuf>,
    pub timed_out: bool,
    /// Behaviour (edges) seen for the first time in this run.
    pub new_edges: usize,
    /// Hex MD5 of the target's trace output for crashing runs.
    pub crash_digest: Option<String>,
}

impl ExecutionResult {
    pub fn new(classification: Classification, original: TestVector, executed: TestVector) -> Self {
        Self {
            classification,
            original,
            executed,
            artifact: None,
            timed_out: false,
            new_edges: 0,
            crash_digest: None,
        }
    }
}

/// Brackets one execution and turns what the target left behind into a result.
///
/// Classification never fails: missing or unreadable output is itself a
/// signal and is classified as [`Classification::Archive`].
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once the server is up and before the trace runs. Must leave
    /// whatever the target already wrote in place.
    fn on_start(&self, server: &dyn Server);

    /// Called after the server process exited.
    fn on_stop(&self, server: &dyn Server);

    fn classify(
        &self,
        trace_output: &Path,
        original: TestVector,
        executed: TestVector,
    ) -> ExecutionResult;
}

/// Default [`Agent`] reading branch traces written by an instrumented target.
///
/// The trace output is either a single marker line (`CRASH`, `TIMEOUT`) or
/// one `from:to` edge per line. Numbers with a `0x` prefix are hex, anything
/// else is decimal. A run is good when it covers at least one edge no earlier
/// run of this campaign covered.
#[derive(Debug, Default)]
pub struct BranchTraceAgent {
    known_edges: Mutex<HashSet<(u64, u64)>>,
}

impl BranchTraceAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct edges seen so far.
    pub fn edge_count(&self) -> usize {
        self.known_edges
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn parse_number(text: &str) -> Option<u64> {
        let text = text.trim();
        match text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => text.parse().ok(),
        }
    }

    fn parse_edge(line: &str) -> Option<(u64, u64)> {
        let (from, to) = line.split_once(':')?;
        Some((Self::parse_number(from)?, Self::parse_number(to)?))
    }
}

impl Agent for BranchTraceAgent {
    fn name(&self) -> &'static str {
        "BranchTraceAgent"
    }

    fn on_start(&self, server: &dyn Server) {
        if let Err(e) = fs::create_dir_all(server.traces_folder()) {
            warn!(server = server.id(), error = %e, "could not create traces folder");
        }
    }

    fn on_stop(&self, server: &dyn Server) {
        debug!(server = server.id(), "target stopped");
    }

    fn classify(
        &self,
        trace_output: &Path,
        original: TestVector,
        executed: TestVector,
    ) -> ExecutionResult {
        // Targets may dump binary data after the marker line.
        let raw = match fs::read(trace_output) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = ?trace_output, error = %e, "unreadable trace output");
                }
                return ExecutionResult::new(Classification::Archive, original, executed);
            }
        };

        let content = String::from_utf8_lossy(&raw);
        let first_line = content.lines().map(str::trim).find(|l| !l.is_empty());
        match first_line {
            None => ExecutionResult::new(Classification::Archive, original, executed),
            Some(CRASH_MARKER) => {
                let mut result = ExecutionResult::new(Classification::Crash, original, executed);
                result.crash_digest = Some(format!("{:x}", md5::compute(&raw)));
                result
            }
            Some(TIMEOUT_MARKER) => {
                let mut result = ExecutionResult::new(Classification::Archive, original, executed);
                result.timed_out = true;
                result
            }
            Some(_) => {
                let mut known = self.known_edges.lock().unwrap_or_else(|p| p.into_inner());
                let new_edges = content
                    .lines()
                    .filter_map(Self::parse_edge)
                    .filter(|edge| known.insert(*edge))
                    .count();
                drop(known);

                let classification = if new_edges > 0 {
                    Classification::Good
                } else {
                    Classification::Archive
                };
                let mut result = ExecutionResult::new(classification, original, executed);
                result.new_edges = new_edges;
                result
            }
        }
    }
}
