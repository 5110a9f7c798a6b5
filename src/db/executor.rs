//! Query execution engine.
//!
//! This module runs validated SQL and delivers the result in one of two ways:
//! - Buffered: all rows collected under a single timeout, plus an export
//! - Streamed: rows pulled one by one, serialized into sealed chunks
//!
//! # Architecture
//!
//! Rows come from [`row_stream`], which decodes every backend into the same
//! [`SqlRow`] shape, so this module has no per-database code. The streamed
//! path runs the row source in its own task and hands chunks over a bounded
//! channel ([`ChunkStream`]); [`StreamingExecutor::run`] drains that channel
//! into a complete [`StreamedResult`].

use crate::config::{
    DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_STREAM_BATCH_SIZE, DEFAULT_STREAM_MAX_MEMORY_MB,
};
use crate::db::estimate::estimate_table;
use crate::db::pool::DbPool;
use crate::db::stream::{self, ChunkEncoder, ChunkStream, StreamThresholds, encode_all};
use crate::db::types::{SqlRow, row_stream};
use crate::error::{DbError, DbResult};
use crate::models::{
    BufferedResult, ChunkFormat, ExecutionOutcome, RunOptions, StreamDecision, StreamStats,
    StreamedResult,
};
use futures_util::{StreamExt, TryStreamExt};
use humansize::{BINARY, format_size};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at};
use tracing::{debug, info, warn};

/// Sealed chunks allowed to wait in the channel before the producer blocks.
const CHANNEL_DEPTH: usize = 4;

/// Rows sampled when estimating the in-memory size of a buffered result.
const SIZE_SAMPLE_ROWS: usize = 100;

/// Tunables for [`StreamingExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Master switch; when off every query is buffered.
    pub enable_streaming: bool,
    pub batch_size: usize,
    /// Buffered results estimated above this size carry a warning.
    pub max_memory_bytes: u64,
    pub query_timeout: Duration,
    pub thresholds: StreamThresholds,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            enable_streaming: true,
            batch_size: DEFAULT_STREAM_BATCH_SIZE,
            max_memory_bytes: DEFAULT_STREAM_MAX_MEMORY_MB * 1024 * 1024,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            thresholds: StreamThresholds::default(),
        }
    }
}

/// Runs queries with buffered or chunked delivery.
#[derive(Debug, Clone, Default)]
pub struct StreamingExecutor {
    settings: ExecutorSettings,
}

impl StreamingExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    fn timeout_secs(&self) -> u32 {
        u32::try_from(self.settings.query_timeout.as_secs()).unwrap_or(u32::MAX)
    }

    /// Choose the delivery path. The catalog is only consulted when no
    /// cheaper trigger has already decided.
    pub async fn decide(&self, pool: &DbPool, sql: &str, options: &RunOptions) -> StreamDecision {
        let enabled = self.settings.enable_streaming;
        let needs_estimate = enabled && !options.force_stream && !stream::lexical_trigger(sql);

        let estimate = match options.table.as_deref() {
            Some(table) if needs_estimate => {
                estimate_table(pool, table, self.settings.query_timeout).await
            }
            _ => None,
        };

        stream::decide(
            sql,
            enabled,
            options.force_stream,
            estimate.as_ref(),
            self.settings.thresholds,
        )
    }

    /// Execute `sql` and return a complete result.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Timeout`] if a buffered run exceeds the query
    /// timeout and [`DbError::StreamAborted`] if a streamed run fails after
    /// it started producing rows.
    pub async fn run(
        &self,
        pool: &DbPool,
        sql: &str,
        options: &RunOptions,
    ) -> DbResult<ExecutionOutcome> {
        let decision = self.decide(pool, sql, options).await;
        info!(
            stream = decision.stream,
            reason = ?decision.reason,
            format = %options.format,
            db_type = %pool.db_type(),
            "Executing query"
        );

        if decision.stream {
            self.run_streamed(pool, sql, options, decision)
                .await
                .map(ExecutionOutcome::Streamed)
        } else {
            self.run_buffered(pool, sql, options, decision)
                .await
                .map(ExecutionOutcome::Buffered)
        }
    }

    /// Execute once and hold every row in memory.
    pub async fn run_buffered(
        &self,
        pool: &DbPool,
        sql: &str,
        options: &RunOptions,
        decision: StreamDecision,
    ) -> DbResult<BufferedResult> {
        let start = Instant::now();
        let fetch = row_stream(pool, sql, options.decode_binary).try_collect::<Vec<SqlRow>>();
        let rows = match timeout(self.settings.query_timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => return Err(DbError::timeout("query", self.timeout_secs())),
        };

        let export = encode_all(options.format, &rows)?;
        let estimated_size_bytes = estimate_result_size(&rows);
        let memory_warning = (estimated_size_bytes > self.settings.max_memory_bytes).then(|| {
            format!(
                "Result is about {} in memory, above the {} limit. \
                 Use force_stream for chunked delivery.",
                format_size(estimated_size_bytes, BINARY),
                format_size(self.settings.max_memory_bytes, BINARY)
            )
        });
        if let Some(message) = &memory_warning {
            warn!(estimated_size_bytes, "{}", message);
        }

        let columns = rows
            .first()
            .map(|row| row.columns.to_vec())
            .unwrap_or_default();
        let row_count = rows.len() as u64;
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(row_count, duration_ms, estimated_size_bytes, "Buffered query complete");

        Ok(BufferedResult {
            columns,
            rows: rows.into_iter().map(|row| row.values).collect(),
            row_count,
            duration_ms,
            estimated_size_bytes,
            format: options.format,
            export,
            decision,
            memory_warning,
        })
    }

    /// Start a chunked run and return the channel of sealed chunks.
    ///
    /// Must be called inside a tokio runtime; the row source runs in a
    /// spawned task that owns its own pool handle. The query timeout bounds
    /// the whole run, counted from this call.
    pub fn stream(&self, pool: &DbPool, sql: &str, options: &RunOptions) -> ChunkStream {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let producer = ChunkProducer {
            pool: pool.clone(),
            sql: sql.to_string(),
            format: options.format,
            decode_binary: options.decode_binary,
            batch_size: self.settings.batch_size,
            deadline: tokio::time::Instant::now() + self.settings.query_timeout,
            timeout_secs: self.timeout_secs(),
        };
        let handle = tokio::spawn(producer.run(tx));
        ChunkStream::new(rx, handle)
    }

    /// Drain [`Self::stream`] into a complete result with aggregate stats.
    pub async fn run_streamed(
        &self,
        pool: &DbPool,
        sql: &str,
        options: &RunOptions,
        decision: StreamDecision,
    ) -> DbResult<StreamedResult> {
        let start = Instant::now();
        let mut chunks = Vec::new();
        let mut source = self.stream(pool, sql, options);
        while let Some(chunk) = source.next().await {
            chunks.push(chunk?);
        }

        let total_rows: u64 = chunks.iter().map(|c| u64::from(c.row_count)).sum();
        let total_bytes: u64 = chunks.iter().map(|c| u64::from(c.byte_size)).sum();
        let chunk_count = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
        let average_batch_size = if chunk_count == 0 {
            0.0
        } else {
            total_rows as f64 / f64::from(chunk_count)
        };
        let stats = StreamStats {
            total_rows,
            chunk_count,
            average_batch_size,
            total_bytes,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            total_rows,
            chunk_count,
            average_batch_size,
            total_size = %format_size(total_bytes, BINARY),
            duration_ms = stats.duration_ms,
            "Streamed query complete"
        );

        Ok(StreamedResult {
            format: options.format,
            chunks,
            stats,
            decision,
        })
    }
}

/// Owned state for the spawned row-to-chunk task.
struct ChunkProducer {
    pool: DbPool,
    sql: String,
    format: ChunkFormat,
    decode_binary: bool,
    batch_size: usize,
    deadline: tokio::time::Instant,
    timeout_secs: u32,
}

impl ChunkProducer {
    async fn run(self, tx: mpsc::Sender<DbResult<crate::models::Chunk>>) {
        let mut rows = row_stream(&self.pool, &self.sql, self.decode_binary);
        let mut encoder = ChunkEncoder::new(self.format, self.batch_size);
        let expired = || -> Option<DbResult<SqlRow>> {
            Some(Err(DbError::timeout("streamed query", self.timeout_secs)))
        };

        loop {
            // Rows already buffered by the driver resolve without yielding,
            // so the deadline is checked before every pull as well.
            let next = if tokio::time::Instant::now() >= self.deadline {
                expired()
            } else {
                match timeout_at(self.deadline, rows.next()).await {
                    Ok(next) => next,
                    Err(_) => expired(),
                }
            };

            let row = match next {
                None => break,
                Some(Ok(row)) => row,
                Some(Err(e)) => {
                    let aborted = DbError::stream_aborted(
                        encoder.chunks_sealed(),
                        encoder.total_rows(),
                        e.to_string(),
                    );
                    warn!(
                        chunks_completed = encoder.chunks_sealed(),
                        rows_streamed = encoder.total_rows(),
                        error = %e,
                        "Stream aborted"
                    );
                    let _ = tx.send(Err(aborted)).await;
                    return;
                }
            };

            match encoder.push(&row) {
                Ok(Some(chunk)) => {
                    debug!(
                        index = chunk.index,
                        rows = chunk.row_count,
                        bytes = chunk.byte_size,
                        "Chunk sealed"
                    );
                    if tx.send(Ok(chunk)).await.is_err() {
                        debug!("Chunk consumer dropped, stopping stream");
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let aborted = DbError::stream_aborted(
                        encoder.chunks_sealed(),
                        encoder.total_rows(),
                        e.to_string(),
                    );
                    let _ = tx.send(Err(aborted)).await;
                    return;
                }
            }
        }

        if let Some(chunk) = encoder.finish() {
            let _ = tx.send(Ok(chunk)).await;
        }
    }
}

/// Mean serialized size of up to [`SIZE_SAMPLE_ROWS`] rows, times the row count.
fn estimate_result_size(rows: &[SqlRow]) -> u64 {
    let sample = &rows[..rows.len().min(SIZE_SAMPLE_ROWS)];
    if sample.is_empty() {
        return 0;
    }
    let sampled_bytes: usize = sample
        .iter()
        .map(|row| serde_json::to_vec(&row.values).map(|v| v.len()).unwrap_or(0))
        .sum();
    let mean = sampled_bytes as u64 / sample.len() as u64;
    mean.saturating_mul(rows.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamReason;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn sqlite_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        DbPool::SQLite(pool)
    }

    fn executor(batch_size: usize) -> StreamingExecutor {
        StreamingExecutor::new(ExecutorSettings {
            batch_size,
            ..ExecutorSettings::default()
        })
    }

    const FIVE_ROWS: &str = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5) \
                             SELECT x AS id, 'row' || x AS label FROM n";

    #[test]
    fn test_estimate_result_size() {
        let columns: Arc<[String]> = vec!["a".to_string()].into();
        let rows: Vec<SqlRow> = (0..500)
            .map(|_| SqlRow {
                columns: Arc::clone(&columns),
                values: vec![json!(12345)],
            })
            .collect();
        // "[12345]" is 7 bytes
        assert_eq!(estimate_result_size(&rows), 3500);
        assert_eq!(estimate_result_size(&[]), 0);
    }

    #[tokio::test]
    async fn test_buffered_run() {
        let pool = sqlite_pool().await;
        let outcome = executor(2)
            .run(&pool, FIVE_ROWS, &RunOptions::new(ChunkFormat::Csv))
            .await
            .unwrap();
        let ExecutionOutcome::Buffered(result) = outcome else {
            panic!("expected buffered result");
        };
        assert_eq!(result.columns, vec!["id", "label"]);
        assert_eq!(result.row_count, 5);
        assert_eq!(result.rows[0], vec![json!(1), json!("row1")]);
        assert!(result.export.starts_with("id,label\n1,row1\n"));
        assert_eq!(result.decision, StreamDecision::buffered());
        assert!(result.memory_warning.is_none());
    }

    #[tokio::test]
    async fn test_forced_stream_chunks() {
        let pool = sqlite_pool().await;
        let options = RunOptions::new(ChunkFormat::Rows).forced();
        let outcome = executor(2).run(&pool, FIVE_ROWS, &options).await.unwrap();
        let ExecutionOutcome::Streamed(result) = outcome else {
            panic!("expected streamed result");
        };
        assert_eq!(result.decision.reason, StreamReason::ForcedByCaller);
        assert_eq!(result.stats.total_rows, 5);
        assert_eq!(result.stats.chunk_count, 3);
        assert_eq!(result.stats.average_batch_size, 5.0 / 3.0);
        let indexes: Vec<u32> = result.chunks.iter().map(|c| c.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_disabled_streaming_buffers_forced_run() {
        let pool = sqlite_pool().await;
        let executor = StreamingExecutor::new(ExecutorSettings {
            enable_streaming: false,
            ..ExecutorSettings::default()
        });
        let outcome = executor
            .run(&pool, "SELECT 1 AS one", &RunOptions::default().forced())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Buffered(_)));
    }

    #[tokio::test]
    async fn test_memory_warning() {
        let pool = sqlite_pool().await;
        let executor = StreamingExecutor::new(ExecutorSettings {
            max_memory_bytes: 8,
            ..ExecutorSettings::default()
        });
        let result = executor
            .run_buffered(&pool, FIVE_ROWS, &RunOptions::default(), StreamDecision::buffered())
            .await
            .unwrap();
        assert!(result.memory_warning.unwrap().contains("force_stream"));
    }

    #[tokio::test]
    async fn test_stream_channel_yields_in_order() {
        let pool = sqlite_pool().await;
        let mut chunks = executor(1).stream(&pool, FIVE_ROWS, &RunOptions::new(ChunkFormat::Json));
        let mut seen = Vec::new();
        while let Some(chunk) = chunks.next_chunk().await {
            seen.push(chunk.unwrap().index);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failure_before_first_row_aborts_stream() {
        let pool = sqlite_pool().await;
        let err = executor(10)
            .run(&pool, "SELECT * FROM no_such_table", &RunOptions::default())
            .await
            .unwrap_err();
        // SELECT * streams
        assert!(matches!(
            err,
            DbError::StreamAborted {
                chunks_completed: 0,
                rows_streamed: 0,
                ..
            }
        ));
    }
}
