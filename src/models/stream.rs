//! Execution result models: buffering decision, chunks and aggregate stats.

use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// Serialized representation of result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFormat {
    /// Newline-delimited JSON arrays of column values
    Rows,
    /// RFC 4180 CSV with a single header line
    Csv,
    /// One JSON array of row objects
    #[default]
    Json,
}

impl std::fmt::Display for ChunkFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rows => write!(f, "rows"),
            Self::Csv => write!(f, "csv"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Per-query execution options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub format: ChunkFormat,
    pub force_stream: bool,
    /// Table the query reads from; enables the catalog size estimate.
    pub table: Option<String>,
    /// Try UTF-8 before base64 for binary columns.
    pub decode_binary: bool,
}

impl RunOptions {
    pub fn new(format: ChunkFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_stream = true;
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamReason {
    ForcedByCaller,
    LexicalTrigger,
    SizeEstimate,
    Default,
}

/// Buffered vs. chunked, decided once per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
pub struct StreamDecision {
    pub stream: bool,
    pub reason: StreamReason,
}

impl StreamDecision {
    pub fn buffered() -> Self {
        Self {
            stream: false,
            reason: StreamReason::Default,
        }
    }

    pub fn streamed(reason: StreamReason) -> Self {
        Self {
            stream: true,
            reason,
        }
    }
}

/// One sealed, ordered unit of a streamed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct Chunk {
    /// 1-based, strictly increasing
    pub index: u32,
    pub row_count: u32,
    pub byte_size: u32,
    #[serde(serialize_with = "payload_as_text")]
    #[schemars(with = "String")]
    pub payload: Bytes,
}

impl Chunk {
    pub fn seal(index: u32, row_count: u32, payload: Vec<u8>) -> Self {
        Self {
            index,
            row_count,
            byte_size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            payload: Bytes::from(payload),
        }
    }
}

fn payload_as_text<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(payload))
}

/// Result of a single buffered execution.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct BufferedResult {
    pub columns: Vec<String>,
    /// Row values in column order
    pub rows: Vec<Vec<JsonValue>>,
    pub row_count: u64,
    pub duration_ms: u64,
    /// Mean serialized size of sampled rows times the row count
    pub estimated_size_bytes: u64,
    pub format: ChunkFormat,
    /// The full result in `format`; identical to the concatenated chunks of a streamed run.
    pub export: String,
    pub decision: StreamDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_warning: Option<String>,
}

/// Aggregate figures for a completed stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, JsonSchema)]
pub struct StreamStats {
    pub total_rows: u64,
    pub chunk_count: u32,
    pub average_batch_size: f64,
    pub total_bytes: u64,
    pub duration_ms: u64,
}

/// Result of a completed chunked execution.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct StreamedResult {
    pub format: ChunkFormat,
    pub chunks: Vec<Chunk>,
    pub stats: StreamStats,
    pub decision: StreamDecision,
}

impl StreamedResult {
    /// Concatenate chunk payloads in order.
    pub fn reconstruct(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stats.total_bytes as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.payload);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Buffered(BufferedResult),
    Streamed(StreamedResult),
}

impl ExecutionOutcome {
    pub fn decision(&self) -> StreamDecision {
        match self {
            Self::Buffered(r) => r.decision,
            Self::Streamed(r) => r.decision,
        }
    }

    pub fn row_count(&self) -> u64 {
        match self {
            Self::Buffered(r) => r.row_count,
            Self::Streamed(r) => r.stats.total_rows,
        }
    }

    /// Full serialized export, whichever path produced it.
    pub fn export_bytes(&self) -> Vec<u8> {
        match self {
            Self::Buffered(r) => r.export.clone().into_bytes(),
            Self::Streamed(r) => r.reconstruct(),
        }
    }
}
