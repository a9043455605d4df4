use crate::executor::ExecutorTimings;
use crate::mutator::{CertificatePool, MutationStrategy};
use crate::server::CommandServerConfig;
use crate::vector::{CertificateStructure, ExecutionMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seed for mutation randomness; entropy from the OS when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub mutator: MutationStrategy,
    /// Execution modes a synthesized vector may use.
    #[serde(default = "default_modes")]
    pub modes: Vec<ExecutionMode>,
}

pub fn default_iterations() -> u64 {
    1_000_000
}
pub fn default_workers() -> usize {
    1
}
fn default_modes() -> Vec<ExecutionMode> {
    ExecutionMode::ALL.to_vec()
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            workers: default_workers(),
            seed: None,
            mutator: MutationStrategy::default(),
            modes: default_modes(),
        }
    }
}

/// How the target servers are launched.
///
/// `command` is an argv template; `{port}`, `{id}` and `{traces}` are
/// replaced per server. Server `i` listens on `base-port + i`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_server_count")]
    pub count: u32,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_traces_folder")]
    pub traces_folder: PathBuf,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_server_count() -> u32 {
    1
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_base_port() -> u16 {
    4433
}
pub fn default_traces_folder() -> PathBuf {
    PathBuf::from("./traces")
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            count: default_server_count(),
            host: default_host(),
            base_port: default_base_port(),
            traces_folder: default_traces_folder(),
            working_dir: None,
        }
    }
}

impl ServerSettings {
    pub fn command_server_config(&self, id: u32) -> Result<CommandServerConfig, anyhow::Error> {
        let port = u16::try_from(id)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Server {} has no port: base port {} leaves too little room",
                    id,
                    self.base_port
                )
            })?;
        Ok(CommandServerConfig {
            command: self.command.clone(),
            host: self.host.clone(),
            port,
            traces_folder: self.traces_folder.clone(),
            working_dir: self.working_dir.clone(),
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Holds the `good`, `faulty` and `crash` bins.
    #[serde(default = "default_output_folder")]
    pub output_folder: PathBuf,
    /// Defaults to `<output-folder>/archive`.
    #[serde(default)]
    pub archive_folder: Option<PathBuf>,
}

pub fn default_output_folder() -> PathBuf {
    PathBuf::from("./.evolver_corpus")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            output_folder: default_output_folder(),
            archive_folder: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CertificateSettings {
    #[serde(default)]
    pub server: Vec<CertificateStructure>,
    #[serde(default)]
    pub client: Vec<CertificateStructure>,
}

impl CertificateSettings {
    pub fn pool(&self) -> CertificatePool {
        CertificatePool::new(self.server.clone(), self.client.clone())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimingSettings {
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_transport_window_ms")]
    pub transport_window_ms: u64,
    #[serde(default = "default_transport_retry_interval_ms")]
    pub transport_retry_interval_ms: u64,
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,
    #[serde(default)]
    pub max_transport_restarts: Option<u32>,
    /// Socket read timeout used by the protocol engine.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_acquire_timeout_ms() -> u64 {
    60_000
}
fn default_transport_window_ms() -> u64 {
    10_000
}
fn default_transport_retry_interval_ms() -> u64 {
    50
}
fn default_exit_timeout_ms() -> u64 {
    30_000
}
fn default_io_timeout_ms() -> u64 {
    2000
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            transport_window_ms: default_transport_window_ms(),
            transport_retry_interval_ms: default_transport_retry_interval_ms(),
            exit_timeout_ms: default_exit_timeout_ms(),
            max_transport_restarts: None,
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl TimingSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn executor_timings(&self) -> ExecutorTimings {
        ExecutorTimings {
            transport_window: Duration::from_millis(self.transport_window_ms),
            retry_interval: Duration::from_millis(self.transport_retry_interval_ms),
            exit_timeout: Duration::from_millis(self.exit_timeout_ms),
            max_transport_restarts: self.max_transport_restarts,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EvolverConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub servers: ServerSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub certificates: CertificateSettings,
    #[serde(default)]
    pub timing: TimingSettings,
}

impl EvolverConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EvolverConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
