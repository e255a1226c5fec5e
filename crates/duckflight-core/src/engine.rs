//! Engine adaptor over an embedded DuckDB database.
//!
//! A DuckDB `Connection` must not run two statements at once, so the engine
//! keeps a small pool of connections to the same database. A semaphore with
//! one permit per connection gates access: a request holds its permit, and
//! therefore its connection, until the statement is finished or its cursor is
//! dropped.
//!
//! Statements run on the blocking pool. Queries are executed as streaming
//! results and their batches are handed to the async side over a bounded
//! channel, so a slow consumer stalls the engine instead of growing a buffer.

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use duckdb::{AccessMode, Config, Connection};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_BATCH_BUFFER: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("io: {0}")]
    Io(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<duckdb::Error> for EngineError {
    fn from(e: duckdb::Error) -> Self {
        EngineError::Query(e.to_string())
    }
}

/// Configuration for opening the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database file; `None` opens an in-memory database
    pub path: Option<PathBuf>,
    /// Open file databases read-only
    pub read_only: bool,
    /// Number of pooled connections (and concurrent statements)
    pub pool_size: usize,
    /// Batches buffered between the engine thread and the consumer
    pub batch_buffer: usize,
    /// LOAD every extension marked installed at startup
    pub load_extensions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        EngineConfig {
            path: None,
            read_only: true,
            pool_size: DEFAULT_POOL_SIZE,
            batch_buffer: DEFAULT_BATCH_BUFFER,
            load_extensions: true,
        }
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        EngineConfig {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::in_memory()
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_batch_buffer(mut self, batch_buffer: usize) -> Self {
        self.batch_buffer = batch_buffer.max(1);
        self
    }

    pub fn with_load_extensions(mut self, load_extensions: bool) -> Self {
        self.load_extensions = load_extensions;
        self
    }

    /// In-memory databases are always writable.
    pub fn effective_read_only(&self) -> bool {
        self.read_only && self.path.is_some()
    }
}

pub type BatchSender = mpsc::Sender<Result<RecordBatch, EngineError>>;

/// A running statement: its schema plus the batches still to come.
///
/// Dropping the cursor tells the producer to stop.
#[derive(Debug)]
pub struct QueryCursor {
    schema: SchemaRef,
    batches: mpsc::Receiver<Result<RecordBatch, EngineError>>,
}

impl QueryCursor {
    /// Create a cursor fed by the returned sender.
    pub fn channel(schema: SchemaRef, capacity: usize) -> (BatchSender, QueryCursor) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, QueryCursor { schema, batches: rx })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Next batch in engine order; `None` once the statement is exhausted.
    pub async fn next(&mut self) -> Option<Result<RecordBatch, EngineError>> {
        self.batches.recv().await
    }
}

/// The two operations the protocol layer needs from an engine.
#[async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    /// Result schema of `sql`, without handing out any rows.
    async fn describe(&self, sql: &str) -> Result<SchemaRef, EngineError>;

    /// Start executing `sql`.
    async fn execute(&self, sql: &str) -> Result<QueryCursor, EngineError>;
}

struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

/// A connection checked out of the pool; returned on drop.
struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn get(&self) -> Result<&Connection, EngineError> {
        self.conn
            .as_ref()
            .ok_or_else(|| EngineError::Internal("pooled connection already released".into()))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

/// DuckDB-backed [`QueryEngine`].
pub struct DuckDbEngine {
    pool: Arc<ConnectionPool>,
    config: EngineConfig,
    version: String,
    extensions: Vec<String>,
}

impl DuckDbEngine {
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let primary = open_connection(&config)?;

        let extensions = if config.load_extensions {
            load_installed_extensions(&primary)
        } else {
            Vec::new()
        };

        let version: String = primary.query_row("SELECT version()", [], |row| row.get(0))?;

        let pool_size = config.pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 1..pool_size {
            connections.push(primary.try_clone()?);
        }
        connections.push(primary);

        info!(
            path = %config
                .path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".into()),
            read_only = config.effective_read_only(),
            pool_size,
            version = %version,
            "opened duckdb"
        );

        Ok(DuckDbEngine {
            pool: Arc::new(ConnectionPool {
                idle: Mutex::new(connections),
                permits: Arc::new(Semaphore::new(pool_size)),
            }),
            config,
            version,
            extensions,
        })
    }

    /// Engine version string, e.g. `v1.4.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn read_only(&self) -> bool {
        self.config.effective_read_only()
    }

    pub fn loaded_extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn acquire(&self) -> Result<PooledConnection, EngineError> {
        let permit = self
            .pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Internal("connection pool closed".into()))?;
        let conn = self
            .pool
            .idle
            .lock()
            .pop()
            .ok_or_else(|| EngineError::Internal("no idle connection for permit".into()))?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.pool.clone(),
            _permit: permit,
        })
    }
}

#[async_trait]
impl QueryEngine for DuckDbEngine {
    async fn describe(&self, sql: &str) -> Result<SchemaRef, EngineError> {
        let conn = self.acquire().await?;
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.get()?;
            if let Ok(schema) = empty_result_schema(conn, &sql) {
                return Ok(schema);
            }
            // Statements that cannot be wrapped are described by running them
            // inside a transaction that is always rolled back.
            conn.execute_batch("BEGIN TRANSACTION")?;
            let described = materialized_schema(conn, &sql);
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback after describing statement failed");
            }
            described
        })
        .await
        .map_err(|e| EngineError::Internal(format!("engine task failed: {e}")))?
    }

    async fn execute(&self, sql: &str) -> Result<QueryCursor, EngineError> {
        let conn = self.acquire().await?;
        let sql = sql.to_string();
        let capacity = self.config.batch_buffer;
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || run_statement(conn, &sql, capacity, ready_tx));
        ready_rx.await.map_err(|_| {
            EngineError::Internal("engine task exited before producing a result".into())
        })?
    }
}

/// Wrap a query so that it yields its columns and no rows.
fn empty_result_query(sql: &str) -> String {
    let body = sql.trim_end().trim_end_matches(';').trim_end();
    format!("SELECT * FROM (\n{body}\n) AS described LIMIT 0")
}

/// Result schema of a query, without computing any of its rows. Fails for
/// statements that are not queries (DDL, DML, PRAGMA and the like).
fn empty_result_schema(conn: &Connection, sql: &str) -> Result<SchemaRef, EngineError> {
    let mut stmt = conn.prepare(&empty_result_query(sql))?;
    let reader = stmt.query_arrow([])?;
    Ok(reader.get_schema())
}

fn materialized_schema(conn: &Connection, sql: &str) -> Result<SchemaRef, EngineError> {
    let mut stmt = conn.prepare(sql)?;
    let reader = stmt.query_arrow([])?;
    Ok(reader.get_schema())
}

type ReadySender = oneshot::Sender<Result<QueryCursor, EngineError>>;

/// Runs on the blocking pool for the whole life of a statement. The reader,
/// the statement and the pooled connection are released when this returns.
///
/// Queries are streamed chunk by chunk, so rows are only computed as fast as
/// the consumer takes them. Other statements have small results and are
/// materialized.
fn run_statement(conn: PooledConnection, sql: &str, capacity: usize, ready: ReadySender) {
    let conn = match conn.get() {
        Ok(conn) => conn,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    match empty_result_schema(conn, sql) {
        Ok(schema) => match stmt.stream_arrow([], schema.clone()) {
            Ok(stream) => forward_batches(stream, schema, capacity, ready),
            Err(e) => {
                let _ = ready.send(Err(e.into()));
            }
        },
        Err(e) => {
            debug!(error = %e, "statement is not a query, materializing its result");
            match stmt.query_arrow([]) {
                Ok(reader) => {
                    let schema = reader.get_schema();
                    forward_batches(reader, schema, capacity, ready)
                }
                Err(e) => {
                    let _ = ready.send(Err(e.into()));
                }
            }
        }
    }
}

fn forward_batches<I>(mut batches: I, schema: SchemaRef, capacity: usize, ready: ReadySender)
where
    I: Iterator<Item = RecordBatch>,
{
    let (tx, cursor) = QueryCursor::channel(schema, capacity);
    if ready.send(Ok(cursor)).is_err() {
        return;
    }

    let mut sent = 0usize;
    loop {
        // duckdb panics when a chunk cannot be imported; report that instead
        // of ending the stream as if it were complete.
        let next = match panic::catch_unwind(AssertUnwindSafe(|| batches.next())) {
            Ok(Some(batch)) => Ok(batch),
            Ok(None) => break,
            Err(_) => Err(EngineError::Internal(
                "engine panicked while producing a batch".into(),
            )),
        };
        let failed = next.is_err();
        if tx.blocking_send(next).is_err() {
            debug!(batches = sent, "cursor dropped, stopping statement");
            return;
        }
        if failed {
            warn!(batches = sent, "statement aborted mid-stream");
            return;
        }
        sent += 1;
    }
    debug!(batches = sent, "statement exhausted");
}

fn open_connection(config: &EngineConfig) -> Result<Connection, EngineError> {
    let Some(path) = config.path.as_deref() else {
        return Ok(Connection::open_in_memory()?);
    };

    if !path.exists() {
        create_database(path)?;
    }

    if config.read_only {
        let flags = Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        Ok(Connection::open_with_flags(path, flags)?)
    } else {
        Ok(Connection::open(path)?)
    }
}

fn create_database(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Io(format!("create {}: {e}", parent.display())))?;
    }
    drop(Connection::open(path)?);
    info!(path = %path.display(), "created new database");
    Ok(())
}

fn installed_extensions(conn: &Connection) -> Result<Vec<String>, duckdb::Error> {
    let mut stmt = conn.prepare(
        "SELECT extension_name FROM duckdb_extensions() WHERE installed AND NOT loaded",
    )?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names.collect()
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// LOAD each installed extension. Failures are logged and skipped.
fn load_installed_extensions(conn: &Connection) -> Vec<String> {
    let names = match installed_extensions(conn) {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, "failed to list installed extensions");
            return Vec::new();
        }
    };

    let mut loaded = Vec::with_capacity(names.len());
    for name in names {
        match conn.execute_batch(&format!("LOAD {};", quote_identifier(&name))) {
            Ok(()) => {
                info!(extension = %name, "loaded extension");
                loaded.push(name);
            }
            Err(e) => warn!(extension = %name, error = %e, "failed to load extension"),
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use arrow_schema::DataType;
    use std::time::Duration;

    fn memory_engine(pool_size: usize) -> DuckDbEngine {
        DuckDbEngine::open(
            EngineConfig::in_memory()
                .with_pool_size(pool_size)
                .with_batch_buffer(1)
                .with_load_extensions(false),
        )
        .unwrap()
    }

    async fn drain(mut cursor: QueryCursor) -> Vec<RecordBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = cursor.next().await {
            batches.push(batch.unwrap());
        }
        batches
    }

    fn int64_column(batches: &[RecordBatch]) -> Vec<i64> {
        batches
            .iter()
            .flat_map(|b| b.column(0).as_primitive::<Int64Type>().values().to_vec())
            .collect()
    }

    #[tokio::test]
    async fn test_describe_reports_result_schema() {
        let engine = memory_engine(1);
        let schema = engine
            .describe("SELECT 42::INTEGER AS answer, 'x' AS label")
            .await
            .unwrap();

        assert_eq!(schema.fields().len(), 2);
        assert_eq!(schema.field(0).name(), "answer");
        assert_eq!(schema.field(0).data_type(), &DataType::Int32);
        assert_eq!(schema.field(1).name(), "label");
    }

    #[tokio::test]
    async fn test_execute_streams_rows_in_order() {
        let engine = memory_engine(1);
        let cursor = engine
            .execute("SELECT range AS n FROM range(0, 10000) ORDER BY n")
            .await
            .unwrap();
        assert_eq!(cursor.schema().field(0).name(), "n");

        let batches = drain(cursor).await;
        assert!(batches.len() > 1);
        assert_eq!(int64_column(&batches), (0..10000).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_invalid_sql_is_rejected() {
        let engine = memory_engine(1);
        assert!(matches!(
            engine.describe("SELEC nonsense").await,
            Err(EngineError::Query(_))
        ));
        assert!(matches!(
            engine.execute("SELECT * FROM no_such_table").await,
            Err(EngineError::Query(_))
        ));
        // The connection went back to the pool after the failures.
        let batches = drain(engine.execute("SELECT 1::BIGINT").await.unwrap()).await;
        assert_eq!(int64_column(&batches), vec![1]);
    }

    // Rows past the cut-off raise an error, so the first batch can only be
    // seen if the statement is streamed rather than computed up front.
    const LATE_FAILURE: &str = "SELECT CASE WHEN range < 20000000 THEN range \
         ELSE error('row computed too early') END AS n FROM range(0, 30000000)";

    #[tokio::test]
    async fn test_first_batch_arrives_before_result_is_complete() {
        let engine = memory_engine(1);
        let mut cursor = engine.execute(LATE_FAILURE).await.unwrap();
        let first = cursor.next().await.unwrap().unwrap();
        assert_eq!(first.column(0).as_primitive::<Int64Type>().value(0), 0);
        drop(cursor);

        // The connection is released once the dropped cursor stops the producer.
        let batches = drain(engine.execute("SELECT 9::BIGINT").await.unwrap()).await;
        assert_eq!(int64_column(&batches), vec![9]);
    }

    #[tokio::test]
    async fn test_describe_computes_no_rows() {
        let engine = memory_engine(1);
        let schema = engine.describe(LATE_FAILURE).await.unwrap();
        assert_eq!(schema.field(0).name(), "n");
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
    }

    #[tokio::test]
    async fn test_described_and_streamed_schemas_agree() {
        let engine = memory_engine(1);
        let sql = "SELECT range AS n, range::VARCHAR AS s FROM range(0, 10);";
        let described = engine.describe(sql).await.unwrap();
        let cursor = engine.execute(sql).await.unwrap();
        assert_eq!(cursor.schema(), described);
        let batches = drain(cursor).await;
        assert_eq!(int64_column(&batches), (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_non_query_statement_still_returns_rows() {
        let engine = memory_engine(1);
        let schema = engine.describe("PRAGMA version").await.unwrap();
        assert!(!schema.fields().is_empty());

        let batches = drain(engine.execute("PRAGMA version").await.unwrap()).await;
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
    }

    #[test]
    fn test_empty_result_query_strips_terminator() {
        assert_eq!(
            empty_result_query("SELECT 1 -- note\n ;  "),
            "SELECT * FROM (\nSELECT 1 -- note\n) AS described LIMIT 0"
        );
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("httpfs"), "\"httpfs\"");
        assert_eq!(quote_identifier("a\"; DROP"), "\"a\"\"; DROP\"");
    }

    #[tokio::test]
    async fn test_single_connection_serializes_statements() {
        let engine = Arc::new(memory_engine(1));
        let mut first = engine
            .execute("SELECT range AS n FROM range(0, 1000000)")
            .await
            .unwrap();
        assert!(first.next().await.is_some());

        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("SELECT 7::BIGINT AS n").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished());

        drop(first);
        let cursor = tokio::time::timeout(Duration::from_secs(10), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(int64_column(&drain(cursor).await), vec![7]);
    }

    #[tokio::test]
    async fn test_concurrent_statements_do_not_interleave() {
        let engine = Arc::new(memory_engine(2));
        let evens = "SELECT range * 2 AS n FROM range(0, 20000) ORDER BY n";
        let odds = "SELECT range * 2 + 1 AS n FROM range(0, 20000) ORDER BY n";

        let sequential_evens = int64_column(&drain(engine.execute(evens).await.unwrap()).await);
        let sequential_odds = int64_column(&drain(engine.execute(odds).await.unwrap()).await);

        let (a, b) = tokio::join!(
            {
                let engine = engine.clone();
                async move { drain(engine.execute(evens).await.unwrap()).await }
            },
            {
                let engine = engine.clone();
                async move { drain(engine.execute(odds).await.unwrap()).await }
            }
        );
        assert_eq!(int64_column(&a), sequential_evens);
        assert_eq!(int64_column(&b), sequential_odds);
    }

    #[tokio::test]
    async fn test_open_creates_missing_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flight.duckdb");
        assert!(!path.exists());

        let engine = DuckDbEngine::open(
            EngineConfig::new(&path)
                .with_pool_size(2)
                .with_load_extensions(false),
        )
        .unwrap();
        assert!(path.exists());
        assert!(engine.read_only());
        assert!(!engine.version().is_empty());

        let batches = drain(engine.execute("SELECT 5::BIGINT").await.unwrap()).await;
        assert_eq!(int64_column(&batches), vec![5]);
    }

    #[test]
    fn test_in_memory_is_never_read_only() {
        assert!(!EngineConfig::in_memory().effective_read_only());
        assert!(EngineConfig::new("/tmp/x.duckdb").effective_read_only());
        assert!(!EngineConfig::new("/tmp/x.duckdb")
            .with_read_only(false)
            .effective_read_only());
    }

    #[test]
    fn test_config_clamps_sizes() {
        let config = EngineConfig::in_memory()
            .with_pool_size(0)
            .with_batch_buffer(0);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.batch_buffer, 1);
    }
}
