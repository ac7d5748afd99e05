// Persistence layer: request/response log, content-addressed cache, and
// aggregate metrics, all backed by a single SQLite file. Grounded in the
// teacher's `database.rs` for pool setup and the versioned-migration
// runner; the write-behind queue is grounded in the teacher's
// `broker.rs` (batched DB writer task draining an unbounded channel).
use sqlx::sqlite::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::error::SectorFluxError;
use crate::models::{AggregateMetrics, LogEntry, NewLogEntry};

/// History is pruned to this many most recent rows after every insert (§3).
const MAX_HISTORY_ROWS: i64 = 100;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init_schema",
    sql: include_str!("../migrations/001_init_schema.sql"),
}];

enum DbCommand {
    InsertLog(NewLogEntry),
    CachePut { request_body: String, response_status: i64, response_body: String },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the store. Reads go straight to the pool; writes are queued
/// onto a single writer task so request-handling paths never block on
/// disk I/O (§9 write-behind queue).
pub struct Store {
    pool: SqlitePool,
    tx: mpsc::UnboundedSender<DbCommand>,
}

impl Store {
    pub async fn init(db_path: &str) -> Result<Self, SectorFluxError> {
        let pool = init_database(db_path).await.map_err(|e| SectorFluxError::Init(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer_pool = pool.clone();
        tokio::spawn(run_writer(writer_pool, rx));

        Ok(Store { pool, tx })
    }

    /// Queue a log row for persistence. Never blocks; drops and logs on
    /// the rare case the writer task has already gone away.
    pub fn submit_log(&self, entry: NewLogEntry) {
        if self.tx.send(DbCommand::InsertLog(entry)).is_err() {
            error!("write queue closed, dropping log entry");
        }
    }

    /// Queue a cache row for persistence. Same fire-and-forget contract
    /// as `submit_log`.
    pub fn cache_put(&self, request_body: String, response_status: i64, response_body: String) {
        if self
            .tx
            .send(DbCommand::CachePut { request_body, response_status, response_body })
            .is_err()
        {
            error!("write queue closed, dropping cache entry");
        }
    }

    pub async fn get_logs(&self, limit: i64) -> Result<Vec<LogEntry>, SectorFluxError> {
        sqlx::query_as::<_, LogEntry>("SELECT * FROM requests ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SectorFluxError::Write(e.to_string()))
    }

    pub async fn get_log(&self, id: i64) -> Result<Option<LogEntry>, SectorFluxError> {
        sqlx::query_as::<_, LogEntry>("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SectorFluxError::Write(e.to_string()))
    }

    /// Sets the starred flag. Idempotent: an absent `id` affects zero
    /// rows and is not an error (§3).
    pub async fn set_starred(&self, id: i64, starred: bool) -> Result<(), SectorFluxError> {
        sqlx::query("UPDATE requests SET is_starred = ? WHERE id = ?")
            .bind(starred)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| SectorFluxError::Write(e.to_string()))?;
        Ok(())
    }

    /// Looks up a cached response by the exact raw request body (§3).
    pub async fn cache_lookup(&self, request_body: &str) -> Result<Option<(i64, String)>, SectorFluxError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT response_status, response_body FROM cache WHERE request_body = ?",
        )
        .bind(request_body)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SectorFluxError::Write(e.to_string()))?;
        Ok(row)
    }

    /// Computes aggregate metrics over the full (post-pruning) log table
    /// (§4.1). Three independent scans; simplicity over a single fused
    /// query since this runs at most once per second from the broadcaster.
    pub async fn aggregate_metrics(&self) -> Result<AggregateMetrics, SectorFluxError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SectorFluxError::Write(e.to_string()))?;

        if total == 0 {
            return Ok(AggregateMetrics::default());
        }

        let avg_latency_ms: f64 = sqlx::query_scalar("SELECT AVG(duration_ms) FROM requests")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SectorFluxError::Write(e.to_string()))?;

        let cache_hits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE duration_ms = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SectorFluxError::Write(e.to_string()))?;

        Ok(AggregateMetrics {
            total_requests: total,
            avg_latency_ms,
            cache_hit_rate: cache_hits as f64 / total as f64,
        })
    }

    /// Drains the write queue and waits for the writer task to finish
    /// before returning, so no queued log or cache row is lost on a
    /// clean shutdown (§9).
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DbCommand::Shutdown(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run_writer(pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<DbCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            DbCommand::InsertLog(entry) => {
                if let Err(e) = insert_log(&pool, &entry).await {
                    error!("failed to persist log entry: {e}");
                }
            }
            DbCommand::CachePut { request_body, response_status, response_body } => {
                let result = sqlx::query(
                    "INSERT OR REPLACE INTO cache (request_body, response_status, response_body) VALUES (?, ?, ?)",
                )
                .bind(&request_body)
                .bind(response_status)
                .bind(&response_body)
                .execute(&pool)
                .await;
                if let Err(e) = result {
                    error!("failed to persist cache entry: {e}");
                }
            }
            DbCommand::Shutdown(ack) => {
                info!("write queue drained, shutting down writer task");
                let _ = ack.send(());
                break;
            }
        }
    }
}

async fn insert_log(pool: &SqlitePool, entry: &NewLogEntry) -> Result<(), sqlx::Error> {
    let timestamp = chrono::Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT INTO requests (
            timestamp, method, endpoint, model, request_body, response_body,
            response_status, duration_ms, prompt_tokens, completion_tokens,
            prompt_eval_duration_ms, eval_duration_ms, ttft_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&timestamp)
    .bind(&entry.method)
    .bind(&entry.endpoint)
    .bind(&entry.model)
    .bind(&entry.request_body)
    .bind(&entry.response_body)
    .bind(entry.response_status)
    .bind(entry.duration_ms)
    .bind(entry.prompt_tokens)
    .bind(entry.completion_tokens)
    .bind(entry.prompt_eval_duration_ms)
    .bind(entry.eval_duration_ms)
    .bind(entry.ttft_ms)
    .execute(pool)
    .await?;

    sqlx::query("DELETE FROM requests WHERE id NOT IN (SELECT id FROM requests ORDER BY id DESC LIMIT ?)")
        .bind(MAX_HISTORY_ROWS)
        .execute(pool)
        .await?;

    Ok(())
}

async fn init_database(db_file: &str) -> Result<SqlitePool, sqlx::Error> {
    // A bare `sqlite::memory:` URL gives each pooled connection its own
    // empty database, so an in-memory store is pinned to a single
    // connection to keep every query on the same schema and data.
    let pool = if db_file == ":memory:" {
        sqlx::sqlite::SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?
    } else {
        SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_file)).await?
    };

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await?;

    for migration in MIGRATIONS {
        let applied = sqlx::query_as::<_, (i32,)>("SELECT version FROM schema_migrations WHERE version = ?")
            .bind(migration.version)
            .fetch_optional(&pool)
            .await?
            .is_some();

        if applied {
            continue;
        }

        info!("running migration {}: {}", migration.version, migration.name);

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewLogEntry;

    fn sample_entry(duration_ms: i64) -> NewLogEntry {
        NewLogEntry {
            method: "POST".to_string(),
            endpoint: "/api/generate".to_string(),
            model: "llama3".to_string(),
            request_body: "{}".to_string(),
            response_body: "{}".to_string(),
            response_status: 200,
            duration_ms,
            prompt_tokens: 1,
            completion_tokens: 2,
            prompt_eval_duration_ms: 3,
            eval_duration_ms: 4,
            ttft_ms: 5,
        }
    }

    #[tokio::test]
    async fn empty_store_reports_zeroed_metrics() {
        let store = Store::init(":memory:").await.expect("init");
        let metrics = store.aggregate_metrics().await.expect("metrics");
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.avg_latency_ms, 0.0);
        assert_eq!(metrics.cache_hit_rate, 0.0);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn submitted_log_is_persisted_and_pruned() {
        let store = Store::init(":memory:").await.expect("init");
        store.submit_log(sample_entry(100));
        store.shutdown().await;

        let logs = store.get_logs(50).await.expect("get_logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].duration_ms, 100);
        assert!(!logs[0].is_starred);
    }

    #[tokio::test]
    async fn starred_flag_round_trips_and_is_idempotent_on_missing_id() {
        let store = Store::init(":memory:").await.expect("init");
        store.submit_log(sample_entry(50));
        store.shutdown().await;

        let logs = store.get_logs(1).await.expect("get_logs");
        let id = logs[0].id;

        store.set_starred(id, true).await.expect("set_starred");
        let log = store.get_log(id).await.expect("get_log").expect("present");
        assert!(log.is_starred);

        // Absent id: no error, no effect.
        store.set_starred(id + 1000, true).await.expect("set_starred on missing id");
    }

    #[tokio::test]
    async fn cache_put_then_lookup_round_trips() {
        let store = Store::init(":memory:").await.expect("init");
        store.cache_put("{\"prompt\":\"hi\"}".to_string(), 200, "{\"response\":\"ok\"}".to_string());
        store.shutdown().await;

        let hit = store.cache_lookup("{\"prompt\":\"hi\"}").await.expect("lookup");
        assert_eq!(hit, Some((200, "{\"response\":\"ok\"}".to_string())));

        let miss = store.cache_lookup("{\"prompt\":\"nope\"}").await.expect("lookup");
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn metrics_treat_zero_duration_as_cache_hit() {
        let store = Store::init(":memory:").await.expect("init");
        store.submit_log(sample_entry(0));
        store.submit_log(sample_entry(200));
        store.shutdown().await;

        let metrics = store.aggregate_metrics().await.expect("metrics");
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.cache_hit_rate, 0.5);
        assert_eq!(metrics.avg_latency_ms, 100.0);
    }
}
