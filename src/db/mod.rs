//! Database access layer.
//!
//! This module provides:
//! - Connection management with retry and backoff
//! - Type mappings from backend rows to JSON values
//! - Catalog size estimates
//! - Buffered and chunked query execution
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connector;
pub mod estimate;
pub mod executor;
pub mod pool;
pub mod stream;
pub mod types;

pub use connector::{Connector, Sleeper, SqlxConnector, TokioSleeper};
pub use estimate::TableEstimate;
pub use executor::{ExecutorSettings, StreamingExecutor};
pub use pool::{ConnectionManager, DbPool};
pub use stream::{ChunkEncoder, ChunkStream, StreamThresholds};
pub use types::{SqlRow, row_stream};
