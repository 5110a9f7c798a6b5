//! Chunk encoding, the buffered/streamed decision and the chunk channel.
//!
//! [`ChunkEncoder`] is shared by both delivery paths: the buffered export is
//! the encoder run with no batch limit, so concatenated chunks always equal
//! the buffered export byte for byte.

use crate::db::estimate::TableEstimate;
use crate::db::types::SqlRow;
use crate::error::{DbError, DbResult};
use crate::models::{Chunk, ChunkFormat, StreamDecision, StreamReason};
use futures_util::{Stream, StreamExt};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Serializes rows into sealed, size-bounded chunks.
///
/// A full batch is only sealed once the next row arrives, so the chunk that
/// ends the result can carry the format's closing bytes.
#[derive(Debug)]
pub struct ChunkEncoder {
    format: ChunkFormat,
    batch_size: usize,
    columns: Option<Arc<[String]>>,
    buffer: Vec<u8>,
    rows_in_batch: usize,
    total_rows: u64,
    next_index: u32,
}

impl ChunkEncoder {
    pub fn new(format: ChunkFormat, batch_size: usize) -> Self {
        Self {
            format,
            batch_size: batch_size.max(1),
            columns: None,
            buffer: Vec::new(),
            rows_in_batch: 0,
            total_rows: 0,
            next_index: 1,
        }
    }

    /// Rows accepted so far.
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Chunks sealed so far.
    pub fn chunks_sealed(&self) -> u32 {
        self.next_index - 1
    }

    /// Add a row. Returns the previous batch when this row starts a new one.
    pub fn push(&mut self, row: &SqlRow) -> DbResult<Option<Chunk>> {
        let sealed = if self.rows_in_batch >= self.batch_size {
            Some(self.seal())
        } else {
            None
        };

        let first_row = self.total_rows == 0;
        if first_row {
            self.columns = Some(Arc::clone(&row.columns));
            match self.format {
                ChunkFormat::Csv => write_csv_line(
                    &mut self.buffer,
                    row.columns.iter().map(|c| CsvField::Text(c)),
                ),
                ChunkFormat::Json => self.buffer.push(b'['),
                ChunkFormat::Rows => {}
            }
        }

        match self.format {
            ChunkFormat::Rows => {
                serde_json::to_writer(&mut self.buffer, &row.values).map_err(encode_error)?;
                self.buffer.push(b'\n');
            }
            ChunkFormat::Csv => {
                write_csv_line(&mut self.buffer, row.values.iter().map(CsvField::Value));
            }
            ChunkFormat::Json => {
                if !first_row {
                    self.buffer.push(b',');
                }
                write_json_object(&mut self.buffer, &row.columns, &row.values)?;
            }
        }

        self.rows_in_batch += 1;
        self.total_rows += 1;
        Ok(sealed)
    }

    /// Close the result. Returns the final chunk, if any bytes remain.
    ///
    /// An empty JSON result still yields one `[]` chunk; empty CSV and row
    /// results yield nothing.
    pub fn finish(mut self) -> Option<Chunk> {
        if self.format == ChunkFormat::Json {
            if self.total_rows == 0 {
                self.buffer.extend_from_slice(b"[]");
            } else {
                self.buffer.push(b']');
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.seal())
    }

    fn seal(&mut self) -> Chunk {
        let payload = std::mem::take(&mut self.buffer);
        let rows = u32::try_from(self.rows_in_batch).unwrap_or(u32::MAX);
        let chunk = Chunk::seal(self.next_index, rows, payload);
        self.next_index += 1;
        self.rows_in_batch = 0;
        chunk
    }
}

/// Encode a complete row set in one piece.
pub fn encode_all(format: ChunkFormat, rows: &[SqlRow]) -> DbResult<String> {
    let mut encoder = ChunkEncoder::new(format, usize::MAX);
    for row in rows {
        encoder.push(row)?;
    }
    let bytes = encoder
        .finish()
        .map(|chunk| chunk.payload.to_vec())
        .unwrap_or_default();
    String::from_utf8(bytes).map_err(|e| DbError::internal(format!("Export is not UTF-8: {}", e)))
}

fn encode_error(e: serde_json::Error) -> DbError {
    DbError::internal(format!("Failed to serialize row: {}", e))
}

enum CsvField<'a> {
    Text(&'a str),
    Value(&'a JsonValue),
}

fn write_csv_line<'a>(out: &mut Vec<u8>, fields: impl Iterator<Item = CsvField<'a>>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(b',');
        }
        match field {
            CsvField::Text(text) => write_csv_text(out, text),
            CsvField::Value(JsonValue::Null) => {}
            CsvField::Value(JsonValue::String(s)) => write_csv_text(out, s),
            CsvField::Value(other) => write_csv_text(out, &other.to_string()),
        }
    }
    out.push(b'\n');
}

/// RFC 4180 quoting. Empty strings are quoted so they differ from NULL.
fn write_csv_text(out: &mut Vec<u8>, text: &str) {
    let needs_quotes = text.is_empty()
        || text.contains(|c| matches!(c, ',' | '"' | '\n' | '\r'));
    if !needs_quotes {
        out.extend_from_slice(text.as_bytes());
        return;
    }
    out.push(b'"');
    for part in text.split_inclusive('"') {
        out.extend_from_slice(part.as_bytes());
        if part.ends_with('"') {
            out.push(b'"');
        }
    }
    out.push(b'"');
}

/// Object with keys in column order.
fn write_json_object(out: &mut Vec<u8>, columns: &[String], values: &[JsonValue]) -> DbResult<()> {
    out.push(b'{');
    for (i, (name, value)) in columns.iter().zip(values).enumerate() {
        if i > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut *out, name).map_err(encode_error)?;
        out.push(b':');
        serde_json::to_writer(&mut *out, value).map_err(encode_error)?;
    }
    out.push(b'}');
    Ok(())
}

// =============================================================================
// Buffered vs. streamed decision
// =============================================================================

static UNBOUNDED_SELECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*SELECT\s+(?:DISTINCT\s+)?\*").expect("constant pattern")
});

static ROW_BOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:LIMIT|TOP|FETCH)\b").expect("constant pattern"));

static BULK_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:BULK|EXPORT|BACKUP|DUMP|OUTFILE)\b").expect("constant pattern")
});

/// Thresholds for the catalog-estimate trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamThresholds {
    pub rows: u64,
    pub bytes: u64,
}

impl Default for StreamThresholds {
    fn default() -> Self {
        Self {
            rows: 10_000,
            bytes: 10 * 1024 * 1024,
        }
    }
}

/// Whether the text alone suggests an unbounded or bulk read.
pub fn lexical_trigger(sql: &str) -> bool {
    (UNBOUNDED_SELECT.is_match(sql) && !ROW_BOUND.is_match(sql)) || BULK_KEYWORD.is_match(sql)
}

/// Decide buffered vs. streamed delivery. Pure; the estimate is gathered by
/// the caller and `None` simply disables the size trigger.
pub fn decide(
    sql: &str,
    enabled: bool,
    force_stream: bool,
    estimate: Option<&TableEstimate>,
    thresholds: StreamThresholds,
) -> StreamDecision {
    if !enabled {
        return StreamDecision::buffered();
    }
    if force_stream {
        return StreamDecision::streamed(StreamReason::ForcedByCaller);
    }
    if lexical_trigger(sql) {
        return StreamDecision::streamed(StreamReason::LexicalTrigger);
    }
    if let Some(estimate) = estimate {
        let over_rows = estimate.rows > thresholds.rows;
        let over_bytes = estimate.bytes.is_some_and(|b| b > thresholds.bytes);
        if over_rows || over_bytes {
            return StreamDecision::streamed(StreamReason::SizeEstimate);
        }
    }
    StreamDecision::buffered()
}

// =============================================================================
// Chunk channel
// =============================================================================

/// Sealed chunks from a running query, in order.
///
/// The producer runs in its own task and blocks once the bounded channel is
/// full, so memory use is capped by the channel depth. The last item is an
/// error if the row source failed or the producer task died. Dropping the
/// stream stops the producer at its next send.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<DbResult<Chunk>>,
    producer: Option<JoinHandle<()>>,
    chunks_delivered: u32,
    rows_delivered: u64,
    done: bool,
}

impl ChunkStream {
    pub(crate) fn new(rx: mpsc::Receiver<DbResult<Chunk>>, producer: JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer),
            chunks_delivered: 0,
            rows_delivered: 0,
            done: false,
        }
    }

    /// Next chunk, or `None` once the result is complete.
    pub async fn next_chunk(&mut self) -> Option<DbResult<Chunk>> {
        self.next().await
    }

    /// The channel closed: complete only if the producer returned normally.
    fn poll_producer(&mut self, cx: &mut Context<'_>) -> Poll<Option<DbResult<Chunk>>> {
        let Some(handle) = self.producer.as_mut() else {
            self.done = true;
            return Poll::Ready(None);
        };
        let joined = match Pin::new(handle).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(joined) => joined,
        };
        self.producer = None;
        self.done = true;
        match joined {
            Ok(()) => Poll::Ready(None),
            Err(e) => {
                warn!(
                    chunks_completed = self.chunks_delivered,
                    rows_streamed = self.rows_delivered,
                    error = %e,
                    "Chunk producer terminated abnormally"
                );
                Poll::Ready(Some(Err(DbError::stream_aborted(
                    self.chunks_delivered,
                    self.rows_delivered,
                    format!("chunk producer terminated: {}", e),
                ))))
            }
        }
    }
}

impl Stream for ChunkStream {
    type Item = DbResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.chunks_delivered += 1;
                this.rows_delivered += u64::from(chunk.row_count);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => this.poll_producer(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: &[(i64, Option<&str>)]) -> Vec<SqlRow> {
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        values
            .iter()
            .map(|(id, name)| SqlRow {
                columns: Arc::clone(&columns),
                values: vec![json!(id), name.map(|n| json!(n)).unwrap_or(JsonValue::Null)],
            })
            .collect()
    }

    fn chunked(format: ChunkFormat, batch: usize, data: &[SqlRow]) -> Vec<Chunk> {
        let mut encoder = ChunkEncoder::new(format, batch);
        let mut out = Vec::new();
        for row in data {
            out.extend(encoder.push(row).unwrap());
        }
        out.extend(encoder.finish());
        out
    }

    #[tokio::test]
    async fn test_dead_producer_is_an_abort() {
        let data = rows(&[(1, Some("a")), (2, None)]);
        let first = chunked(ChunkFormat::Rows, 1, &data).remove(0);
        let (tx, rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            let _ = tx.send(Ok(first)).await;
            panic!("row decoder failed");
        });

        let mut chunks = ChunkStream::new(rx, producer);
        assert!(chunks.next_chunk().await.unwrap().is_ok());
        match chunks.next_chunk().await {
            Some(Err(DbError::StreamAborted {
                chunks_completed,
                rows_streamed,
                ..
            })) => {
                assert_eq!(chunks_completed, 1);
                assert_eq!(rows_streamed, 1);
            }
            other => panic!("expected StreamAborted, got {:?}", other),
        }
        assert!(chunks.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_finished_producer_ends_cleanly() {
        let (tx, rx) = mpsc::channel::<DbResult<Chunk>>(4);
        let producer = tokio::spawn(async move { drop(tx) });
        let mut chunks = ChunkStream::new(rx, producer);
        assert!(chunks.next_chunk().await.is_none());
        assert!(chunks.next_chunk().await.is_none());
    }

    fn joined(chunks: &[Chunk]) -> String {
        chunks
            .iter()
            .map(|c| String::from_utf8(c.payload.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_csv_header_only_on_first_chunk() {
        let data = rows(&[(1, Some("a")), (2, Some("b")), (3, None)]);
        let chunks = chunked(ChunkFormat::Csv, 2, &data);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0].payload[..], b"id,name\n1,a\n2,b\n");
        assert_eq!(&chunks[1].payload[..], b"3,\n");
        assert_eq!(chunks[0].row_count, 2);
        assert_eq!(chunks[1].row_count, 1);
        assert_eq!(chunks[1].index, 2);
    }

    #[test]
    fn test_csv_quoting() {
        let data = rows(&[
            (1, Some("a,b")),
            (2, Some("say \"hi\"")),
            (3, Some("two\nlines")),
            (4, Some("")),
        ]);
        let text = encode_all(ChunkFormat::Csv, &data).unwrap();
        assert_eq!(
            text,
            "id,name\n1,\"a,b\"\n2,\"say \"\"hi\"\"\"\n3,\"two\nlines\"\n4,\"\"\n"
        );
    }

    #[test]
    fn test_json_brackets_span_chunks() {
        let data = rows(&[(1, Some("a")), (2, Some("b")), (3, Some("c"))]);
        let chunks = chunked(ChunkFormat::Json, 2, &data);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].payload.starts_with(b"["));
        assert!(chunks[1].payload.starts_with(b","));
        assert!(chunks[1].payload.ends_with(b"]"));

        let parsed: JsonValue = serde_json::from_str(&joined(&chunks)).unwrap();
        assert_eq!(parsed[2], json!({"id": 3, "name": "c"}));
    }

    #[test]
    fn test_json_keeps_column_order() {
        let columns: Arc<[String]> = vec!["z".to_string(), "a".to_string()].into();
        let row = SqlRow {
            columns,
            values: vec![json!(1), json!(2)],
        };
        assert_eq!(encode_all(ChunkFormat::Json, &[row]).unwrap(), r#"[{"z":1,"a":2}]"#);
    }

    #[test]
    fn test_exact_multiple_of_batch_has_no_empty_chunk() {
        let data = rows(&[(1, None), (2, None), (3, None), (4, None)]);
        for format in [ChunkFormat::Rows, ChunkFormat::Csv, ChunkFormat::Json] {
            let chunks = chunked(format, 2, &data);
            assert_eq!(chunks.len(), 2, "{}", format);
            assert!(chunks.iter().all(|c| c.row_count == 2));
        }
    }

    #[test]
    fn test_empty_results() {
        assert!(chunked(ChunkFormat::Csv, 10, &[]).is_empty());
        assert!(chunked(ChunkFormat::Rows, 10, &[]).is_empty());
        let json_chunks = chunked(ChunkFormat::Json, 10, &[]);
        assert_eq!(json_chunks.len(), 1);
        assert_eq!(&json_chunks[0].payload[..], b"[]");
        assert_eq!(json_chunks[0].row_count, 0);
        assert_eq!(encode_all(ChunkFormat::Json, &[]).unwrap(), "[]");
        assert_eq!(encode_all(ChunkFormat::Csv, &[]).unwrap(), "");
    }

    #[test]
    fn test_chunked_matches_single_piece() {
        let data = rows(&[
            (1, Some("x")),
            (2, None),
            (3, Some("q\"")),
            (4, Some("")),
            (5, Some("e")),
        ]);
        for format in [ChunkFormat::Rows, ChunkFormat::Csv, ChunkFormat::Json] {
            for batch in [1, 2, 3, 7] {
                assert_eq!(
                    joined(&chunked(format, batch, &data)),
                    encode_all(format, &data).unwrap(),
                    "{} batch {}",
                    format,
                    batch
                );
            }
        }
    }

    #[test]
    fn test_decide_order() {
        let t = StreamThresholds::default();
        let big = TableEstimate {
            rows: 50_000,
            bytes: None,
        };
        assert_eq!(decide("SELECT 1", false, true, Some(&big), t), StreamDecision::buffered());
        assert_eq!(
            decide("SELECT 1", true, true, None, t).reason,
            StreamReason::ForcedByCaller
        );
        assert_eq!(
            decide("select * from users", true, false, None, t).reason,
            StreamReason::LexicalTrigger
        );
        assert_eq!(
            decide("SELECT id FROM users", true, false, Some(&big), t).reason,
            StreamReason::SizeEstimate
        );
        assert_eq!(
            decide("SELECT id FROM users", true, false, None, t),
            StreamDecision::buffered()
        );
    }

    #[test]
    fn test_lexical_trigger() {
        assert!(lexical_trigger("SELECT DISTINCT * FROM t"));
        assert!(!lexical_trigger("SELECT * FROM t LIMIT 10"));
        assert!(!lexical_trigger("SELECT * FROM t ORDER BY id FETCH FIRST 5 ROWS ONLY"));
        assert!(!lexical_trigger("SELECT count(*) FROM t"));
        assert!(lexical_trigger("SELECT id INTO OUTFILE '/tmp/x' FROM t"));
    }

    #[test]
    fn test_byte_estimate_trigger() {
        let estimate = TableEstimate {
            rows: 10,
            bytes: Some(64 * 1024 * 1024),
        };
        let decision = decide(
            "SELECT id FROM t",
            true,
            false,
            Some(&estimate),
            StreamThresholds::default(),
        );
        assert_eq!(decision.reason, StreamReason::SizeEstimate);
    }
}
