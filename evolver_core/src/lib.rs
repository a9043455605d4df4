pub mod agent;
pub mod aggregator;
pub mod campaign;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod executor;
pub mod ids;
pub mod mutator;
pub mod pool;
pub mod server;
pub mod vector;

pub use agent::{Agent, BranchTraceAgent, Classification, ExecutionResult};
pub use aggregator::{ResultAggregator, Statistics};
pub use campaign::{Campaign, CampaignError};
pub use config::EvolverConfig;
pub use corpus::{Bin, CorpusError, CorpusStore, InMemoryVectorStore, OnDiskVectorStore, VectorStore};
pub use engine::{ExecutionFailure, HarnessFailure, ProtocolEngine, SocketEngine, Transport};
pub use executor::{ExecutionStatus, Executor, ExecutorTimings, FuzzingExecutor};
pub use ids::UniqueIdAllocator;
pub use mutator::{CertificatePool, MutationStrategy, Mutator};
pub use pool::{Lease, Occupancy, PoolError, ServerPool};
pub use server::{CommandServer, CommandServerConfig, Server};
pub use vector::{CertificateStructure, Direction, ExecutionMode, ProtocolAction, TestVector, Trace};
