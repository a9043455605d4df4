use crate::agent::{Agent, Classification};
use crate::aggregator::ResultAggregator;
use crate::corpus::Bin;
use crate::engine::{ProtocolEngine, Transport};
use crate::pool::{PoolError, ServerPool};
use crate::server::Server;
use crate::vector::{ExecutionMode, TestVector};
use std::any::Any;
use std::fs;
use std::io::ErrorKind;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Longest pause between two polls while waiting for a target to exit.
const MAX_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The trace ran to completion and the agent classified the run.
    Completed(Classification),
    /// The harness failed; the original vector was captured as a faulty artifact.
    Faulted(String),
}

/// Runs one fuzzing iteration per call.
///
/// The only error an executor surfaces is a fatal pool condition; every
/// other failure is contained in the returned status.
pub trait Executor: Send + Sync {
    fn execute(&self, vector: TestVector) -> Result<ExecutionStatus, PoolError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorTimings {
    /// How long connection attempts may fail before the server is restarted.
    pub transport_window: Duration,
    pub retry_interval: Duration,
    /// Upper bound on waiting for the target to exit after a run.
    pub exit_timeout: Duration,
    /// Restarts allowed while establishing one transport; `None` is unbounded.
    pub max_transport_restarts: Option<u32>,
}

impl Default for ExecutorTimings {
    fn default() -> Self {
        Self {
            transport_window: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
            exit_timeout: Duration::from_secs(30),
            max_transport_restarts: None,
        }
    }
}

/// Drives a test vector against a pooled target server.
///
/// One call walks `start -> connect -> execute -> teardown`. Teardown always
/// runs: the target is waited for (or stopped), the agent classifies the run,
/// the result is committed and the server goes back to the pool.
pub struct FuzzingExecutor {
    pool: Arc<ServerPool>,
    engine: Arc<dyn ProtocolEngine>,
    agent: Arc<dyn Agent>,
    aggregator: Arc<ResultAggregator>,
    timings: ExecutorTimings,
}

impl FuzzingExecutor {
    pub fn new(
        pool: Arc<ServerPool>,
        engine: Arc<dyn ProtocolEngine>,
        agent: Arc<dyn Agent>,
        aggregator: Arc<ResultAggregator>,
        timings: ExecutorTimings,
    ) -> Self {
        Self {
            pool,
            engine,
            agent,
            aggregator,
            timings,
        }
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    fn drive(&self, server: &dyn Server, vector: &mut TestVector) -> Result<(), String> {
        // Output from an earlier run must be gone before the target can
        // write anything, startup crash reports included.
        Self::remove_trace_output(server);
        server
            .start()
            .map_err(|e| format!("Could not start server {}: {e:#}", server.id()))?;
        self.agent.on_start(server);

        let mut transport = self.connect(server, vector.mode)?;
        let outcome = self.engine.execute(vector, transport.as_mut());
        if let Err(e) = transport.close() {
            debug!(server = server.id(), error = %e, "error closing transport");
        }
        outcome.map_err(|e| e.to_string())
    }

    /// Retries at a fixed interval; each time the window runs out the server
    /// is restarted and a new window begins.
    fn connect(
        &self,
        server: &dyn Server,
        mode: ExecutionMode,
    ) -> Result<Box<dyn Transport>, String> {
        let mut restarts = 0u32;
        let mut window_start = Instant::now();
        loop {
            match self.engine.connect(server, mode) {
                Ok(transport) => return Ok(transport),
                Err(e) => trace!(server = server.id(), error = %e, "transport not ready"),
            }

            if window_start.elapsed() >= self.timings.transport_window {
                if self
                    .timings
                    .max_transport_restarts
                    .is_some_and(|max| restarts >= max)
                {
                    return Err(format!(
                        "No transport to server {} after {restarts} restarts",
                        server.id()
                    ));
                }
                restarts += 1;
                warn!(
                    server = server.id(),
                    restarts,
                    window = ?self.timings.transport_window,
                    "no transport within window, restarting server"
                );
                if let Err(e) = server.restart() {
                    error!(server = server.id(), error = %e, "could not restart server");
                }
                window_start = Instant::now();
                continue;
            }
            thread::sleep(self.timings.retry_interval);
        }
    }

    fn capture_faulty(&self, original: &TestVector, reason: &str) -> Option<PathBuf> {
        match self.aggregator.corpus().add(Bin::Faulty, original) {
            Ok(path) => {
                warn!(path = ?path, reason, "captured faulty vector");
                Some(path)
            }
            Err(e) => {
                error!(error = %e, reason, "could not capture faulty vector");
                None
            }
        }
    }

    /// Polls with a doubling backoff. A target still running at the deadline is stopped.
    fn wait_for_exit(&self, server: &dyn Server) {
        let deadline = Instant::now() + self.timings.exit_timeout;
        let mut interval = Duration::from_millis(1);
        while !server.exited() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    server = server.id(),
                    timeout = ?self.timings.exit_timeout,
                    "target did not exit in time, stopping it"
                );
                if let Err(e) = server.stop() {
                    error!(server = server.id(), error = %e, "could not stop target");
                }
                return;
            }
            thread::sleep(interval.min(deadline - now));
            interval = (interval * 2).min(MAX_EXIT_POLL_INTERVAL);
        }
    }

    fn conclude(
        &self,
        server: &dyn Server,
        original: TestVector,
        executed: TestVector,
        faulted: bool,
        artifact: Option<PathBuf>,
    ) -> Classification {
        self.agent.on_stop(server);
        let mut result = self
            .agent
            .classify(&server.trace_output(), original, executed);
        if faulted && result.classification != Classification::Crash {
            result.classification = Classification::Faulty;
        }
        result.artifact = artifact;

        let classification = result.classification;
        if let Ok(Some(path)) = self.aggregator.commit(result) {
            debug!(server = server.id(), ?classification, path = ?path, "committed result");
        }
        classification
    }

    fn remove_trace_output(server: &dyn Server) {
        match fs::remove_file(server.trace_output()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(server = server.id(), error = %e, "could not remove trace output"),
        }
    }
}

impl Executor for FuzzingExecutor {
    fn execute(&self, vector: TestVector) -> Result<ExecutionStatus, PoolError> {
        let original = vector.clone();
        let lease = self.pool.acquire()?;
        let server = Arc::clone(lease.server());
        debug!(server = server.id(), "acquired server");

        let mut executed = vector;
        let fault = match catch_unwind(AssertUnwindSafe(|| {
            self.drive(server.as_ref(), &mut executed)
        })) {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(payload) => Some(format!("Panic during execution: {}", panic_message(&*payload))),
        };
        let artifact = fault
            .as_deref()
            .and_then(|reason| self.capture_faulty(&original, reason));

        self.wait_for_exit(server.as_ref());
        let classification = catch_unwind(AssertUnwindSafe(|| {
            self.conclude(
                server.as_ref(),
                original,
                executed,
                fault.is_some(),
                artifact,
            )
        }));
        lease.release();
        Self::remove_trace_output(server.as_ref());

        match (fault, classification) {
            (Some(reason), _) => Ok(ExecutionStatus::Faulted(reason)),
            (None, Ok(classification)) => Ok(ExecutionStatus::Completed(classification)),
            (None, Err(payload)) => {
                let reason = format!("Panic during classification: {}", panic_message(&*payload));
                error!(server = server.id(), reason = %reason, "run was not classified");
                Ok(ExecutionStatus::Faulted(reason))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}
