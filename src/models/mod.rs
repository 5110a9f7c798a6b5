//! Data models shared by the validator, connection manager and executor.

pub mod connection;
pub mod stream;

pub use connection::{
    AuthMode, ConnectionConfig, ConnectionDescriptor, ConnectionPhase, DatabaseType,
    HealthSnapshot, PoolHealth, TrustConfidence, TrustDecision, TrustSource,
};
pub use stream::{
    BufferedResult, Chunk, ChunkFormat, ExecutionOutcome, RunOptions, StreamDecision,
    StreamReason, StreamStats, StreamedResult,
};
