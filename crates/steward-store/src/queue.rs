// Serialized DB Queue
// One background thread owns the SQLite connection; callers submit SQL and
// block on a completion signal with a timeout. All writes in the process go
// through this queue.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::{json, Map, Number, Value};
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_SQL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SQL_MAX_ROWS: usize = 500;

/// One SQL submission.
#[derive(Debug, Clone)]
pub struct SqlRequest {
    pub sql: String,
    pub params: Vec<Value>,
    pub read_only: bool,
    pub timeout: Duration,
    pub max_rows: usize,
}

impl SqlRequest {
    pub fn read(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            read_only: true,
            timeout: DEFAULT_SQL_TIMEOUT,
            max_rows: DEFAULT_SQL_MAX_ROWS,
        }
    }

    pub fn write(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            read_only: false,
            timeout: DEFAULT_SQL_TIMEOUT,
            max_rows: DEFAULT_SQL_MAX_ROWS,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlMode {
    Read,
    Write,
}

/// Structured executor response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SqlResponse {
    pub ok: bool,
    pub request_id: String,
    pub mode: SqlMode,
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub rows_affected: u64,
    pub error: Option<String>,
}

impl SqlResponse {
    fn failure(request_id: String, mode: SqlMode, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            request_id,
            mode,
            rows: Vec::new(),
            row_count: 0,
            rows_affected: 0,
            error: Some(error.into()),
        }
    }
}

struct Job {
    request: SqlRequest,
    request_id: String,
    reply: oneshot::Sender<SqlResponse>,
}

struct Worker {
    tx: mpsc::UnboundedSender<Job>,
    handle: std::thread::JoinHandle<()>,
}

/// Single-writer SQL executor with correlation ids and safe defaults.
pub struct DbQueue {
    db_path: PathBuf,
    busy_timeout_ms: u64,
    counter: AtomicU64,
    depth: AtomicUsize,
    worker: StdMutex<Option<Worker>>,
    last_error: Arc<StdMutex<Option<String>>>,
}

impl DbQueue {
    pub fn new(db_path: impl AsRef<Path>, busy_timeout_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            db_path: db_path.as_ref().to_path_buf(),
            busy_timeout_ms: if busy_timeout_ms > 0 { busy_timeout_ms } else { 5000 },
            counter: AtomicU64::new(1),
            depth: AtomicUsize::new(0),
            worker: StdMutex::new(None),
            last_error: Arc::new(StdMutex::new(None)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Accepted read-only statement prefixes.
    fn is_read_only_sql(sql: &str) -> bool {
        let head = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        matches!(head.as_str(), "select" | "pragma" | "explain" | "with")
    }

    /// Start the executor thread; idempotent.
    pub fn start(&self) -> bool {
        let mut guard = self.worker.lock().expect("db queue worker lock");
        if let Some(worker) = guard.as_ref() {
            if !worker.handle.is_finished() {
                return false;
            }
        }
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let db_path = self.db_path.clone();
        let busy_timeout_ms = self.busy_timeout_ms;
        let last_error = self.last_error.clone();
        let handle = std::thread::Builder::new()
            .name("steward-db-queue".to_string())
            .spawn(move || run_executor(db_path, busy_timeout_ms, rx, last_error))
            .expect("spawn db queue thread");
        *guard = Some(Worker { tx, handle });
        true
    }

    /// Stop the executor thread; pending jobs drain first.
    pub fn stop(&self) {
        let worker = self.worker.lock().expect("db queue worker lock").take();
        if let Some(worker) = worker {
            drop(worker.tx);
            let _ = worker.handle.join();
        }
    }

    pub fn health(&self) -> Value {
        let running = self
            .worker
            .lock()
            .expect("db queue worker lock")
            .as_ref()
            .map(|worker| !worker.handle.is_finished())
            .unwrap_or(false);
        json!({
            "ok": true,
            "running": running,
            "queue_depth": self.depth.load(Ordering::SeqCst),
            "db_path": self.db_path.display().to_string(),
            "busy_timeout_ms": self.busy_timeout_ms,
            "last_error": self.last_error.lock().expect("last error lock").clone(),
        })
    }

    /// Submit one request and wait for its completion signal. A timeout
    /// returns `sql_queue_timeout` without cancelling the in-flight query.
    pub async fn execute(&self, request: SqlRequest) -> SqlResponse {
        let request_id = format!("sqlq_{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let mode = if request.read_only { SqlMode::Read } else { SqlMode::Write };

        let sql = request.sql.trim();
        if sql.is_empty() {
            return SqlResponse::failure(request_id, mode, "sql is required");
        }
        if request.read_only && !Self::is_read_only_sql(sql) {
            return SqlResponse::failure(
                request_id,
                mode,
                "read_only query must be SELECT/PRAGMA/EXPLAIN/WITH",
            );
        }

        self.start();
        let tx = {
            let guard = self.worker.lock().expect("db queue worker lock");
            match guard.as_ref() {
                Some(worker) => worker.tx.clone(),
                None => return SqlResponse::failure(request_id, mode, "db queue not running"),
            }
        };

        let timeout = request.timeout;
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            request,
            request_id: request_id.clone(),
            reply: reply_tx,
        };
        self.depth.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return SqlResponse::failure(request_id, mode, "db queue not running");
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => SqlResponse::failure(request_id, mode, "db queue executor dropped"),
            Err(_) => SqlResponse::failure(request_id, mode, "sql_queue_timeout"),
        }
    }
}

impl Drop for DbQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_executor(
    db_path: PathBuf,
    busy_timeout_ms: u64,
    mut rx: mpsc::UnboundedReceiver<Job>,
    last_error: Arc<StdMutex<Option<String>>>,
) {
    let conn = match open_connection(&db_path, busy_timeout_ms) {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!("db queue failed to open {}: {err}", db_path.display());
            *last_error.lock().expect("last error lock") = Some(err);
            // Fail every queued request instead of wedging callers.
            while let Some(job) = rx.blocking_recv() {
                let mode = if job.request.read_only { SqlMode::Read } else { SqlMode::Write };
                let _ = job
                    .reply
                    .send(SqlResponse::failure(job.request_id, mode, "db connection unavailable"));
            }
            return;
        }
    };

    while let Some(job) = rx.blocking_recv() {
        let response = execute_job(&conn, &job);
        if let Some(error) = &response.error {
            *last_error.lock().expect("last error lock") = Some(error.clone());
        }
        let _ = job.reply.send(response);
    }
}

fn open_connection(db_path: &Path, busy_timeout_ms: u64) -> Result<Connection, String> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let conn = Connection::open(db_path).map_err(|err| err.to_string())?;

    // WAL can fail transiently while another handle holds the lock.
    let mut wal_err = None;
    for _ in 0..3 {
        match conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())) {
            Ok(()) => {
                wal_err = None;
                break;
            }
            Err(err) => {
                wal_err = Some(err.to_string());
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    if let Some(err) = wal_err {
        return Err(format!("failed to enable WAL: {err}"));
    }

    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {busy_timeout_ms}; PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;"
    ))
    .map_err(|err| err.to_string())?;
    Ok(conn)
}

fn execute_job(conn: &Connection, job: &Job) -> SqlResponse {
    let request_id = job.request_id.clone();
    let request = &job.request;
    let params = json_params(&request.params);

    let mut stmt = match conn.prepare(&request.sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            let mode = if request.read_only { SqlMode::Read } else { SqlMode::Write };
            return SqlResponse::failure(request_id, mode, err.to_string());
        }
    };

    // Writes with a RETURNING clause still produce rows; detect via the
    // prepared statement's column count.
    let produces_rows = request.read_only || stmt.column_count() > 0;
    if produces_rows {
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mapped = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let mut object = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                object.insert(column.clone(), column_value(row.get_ref(idx)?));
            }
            Ok(Value::Object(object))
        });
        let rows = match mapped {
            Ok(iter) => {
                let mut rows = Vec::new();
                for row in iter {
                    match row {
                        Ok(value) => rows.push(value),
                        Err(err) => {
                            let mode = if request.read_only { SqlMode::Read } else { SqlMode::Write };
                            return SqlResponse::failure(request_id, mode, err.to_string());
                        }
                    }
                    if rows.len() >= request.max_rows {
                        break;
                    }
                }
                rows
            }
            Err(err) => {
                let mode = if request.read_only { SqlMode::Read } else { SqlMode::Write };
                return SqlResponse::failure(request_id, mode, err.to_string());
            }
        };
        let row_count = rows.len();
        let mode = if request.read_only { SqlMode::Read } else { SqlMode::Write };
        return SqlResponse {
            ok: true,
            request_id,
            mode,
            rows,
            row_count,
            rows_affected: if request.read_only { 0 } else { row_count as u64 },
            error: None,
        };
    }

    match stmt.execute(rusqlite::params_from_iter(params.iter())) {
        Ok(rows_affected) => SqlResponse {
            ok: true,
            request_id,
            mode: SqlMode::Write,
            rows: Vec::new(),
            row_count: 0,
            rows_affected: rows_affected as u64,
            error: None,
        },
        Err(err) => SqlResponse::failure(request_id, SqlMode::Write, err.to_string()),
    }
}

fn json_params(params: &[Value]) -> Vec<SqlValue> {
    params
        .iter()
        .map(|value| match value {
            Value::Null => SqlValue::Null,
            Value::Bool(flag) => SqlValue::Integer(*flag as i64),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    SqlValue::Integer(int)
                } else {
                    SqlValue::Real(number.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(text) => SqlValue::Text(text.clone()),
            other => SqlValue::Text(other.to_string()),
        })
        .collect()
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::Number(int.into()),
        ValueRef::Real(real) => Number::from_f64(real).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).to_string()),
        ValueRef::Blob(blob) => Value::String(format!("<blob {} bytes>", blob.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(dir: &tempfile::TempDir) -> Arc<DbQueue> {
        DbQueue::new(dir.path().join("core.db"), 5000)
    }

    #[tokio::test]
    async fn rejects_mutating_sql_marked_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir);
        let response = queue
            .execute(SqlRequest::read("DELETE FROM sqlite_master", vec![]))
            .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("read_only"));
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir);

        let create = queue
            .execute(SqlRequest::write(
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, text TEXT NOT NULL)",
                vec![],
            ))
            .await;
        assert!(create.ok, "{:?}", create.error);

        let insert = queue
            .execute(SqlRequest::write(
                "INSERT INTO notes (text) VALUES (?1)",
                vec![json!("hello")],
            ))
            .await;
        assert!(insert.ok);
        assert_eq!(insert.rows_affected, 1);
        assert_eq!(insert.mode, SqlMode::Write);

        let read = queue
            .execute(SqlRequest::read("SELECT id, text FROM notes", vec![]))
            .await;
        assert!(read.ok);
        assert_eq!(read.row_count, 1);
        assert_eq!(read.rows[0]["text"], "hello");
    }

    #[tokio::test]
    async fn fifo_write_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir);
        queue
            .execute(SqlRequest::write(
                "CREATE TABLE seq (pos INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT)",
                vec![],
            ))
            .await;

        for idx in 0..20 {
            let response = queue
                .execute(SqlRequest::write(
                    "INSERT INTO seq (label) VALUES (?1)",
                    vec![json!(format!("w{idx}"))],
                ))
                .await;
            assert!(response.ok);
        }

        let read = queue
            .execute(SqlRequest::read("SELECT label FROM seq ORDER BY pos", vec![]))
            .await;
        let labels: Vec<&str> = read.rows.iter().filter_map(|row| row["label"].as_str()).collect();
        let expected: Vec<String> = (0..20).map(|idx| format!("w{idx}")).collect();
        assert_eq!(labels, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn returning_clause_yields_rows_from_write() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir);
        queue
            .execute(SqlRequest::write(
                "CREATE TABLE jobs (job_id INTEGER PRIMARY KEY AUTOINCREMENT, status TEXT)",
                vec![],
            ))
            .await;
        queue
            .execute(SqlRequest::write(
                "INSERT INTO jobs (status) VALUES ('queued')",
                vec![],
            ))
            .await;

        let claim = queue
            .execute(SqlRequest::write(
                "UPDATE jobs SET status = 'running' WHERE job_id IN \
                 (SELECT job_id FROM jobs WHERE status = 'queued' ORDER BY job_id LIMIT 1) \
                 RETURNING job_id, status",
                vec![],
            ))
            .await;
        assert!(claim.ok);
        assert_eq!(claim.row_count, 1);
        assert_eq!(claim.rows[0]["status"], "running");
    }

    #[tokio::test]
    async fn row_cap_limits_read_results() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir);
        queue
            .execute(SqlRequest::write(
                "CREATE TABLE bulk (id INTEGER PRIMARY KEY AUTOINCREMENT)",
                vec![],
            ))
            .await;
        for _ in 0..10 {
            queue
                .execute(SqlRequest::write("INSERT INTO bulk DEFAULT VALUES", vec![]))
                .await;
        }
        let read = queue
            .execute(SqlRequest::read("SELECT id FROM bulk", vec![]).with_max_rows(3))
            .await;
        assert_eq!(read.row_count, 3);
    }

    #[tokio::test]
    async fn statement_failure_reports_error_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir);
        let response = queue
            .execute(SqlRequest::write("INSERT INTO missing_table VALUES (1)", vec![]))
            .await;
        assert!(!response.ok);
        assert!(response.error.is_some());
        assert!(response.request_id.starts_with("sqlq_"));
    }
}
