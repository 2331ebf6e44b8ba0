//! SQLite-based persistence for production use.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{SchedError, SchedResult};
use crate::job::{Job, JobFilter, JobId, JobStatus};
use crate::persistence::StateStore;
use crate::run::{JobRun, RunFilter, RunId, RunStatus};

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RUN_COLUMNS: &str = "id, job_id, scheduled_time, status, log";

/// SQLite-based state store.
///
/// Provides persistent storage with ACID guarantees. The database file may
/// be shared between the pipeline process and command-line clients.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new(path: impl AsRef<Path>) -> SchedResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    /// Create a new in-memory SQLite store.
    pub fn in_memory() -> SchedResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> SchedResult<R>) -> SchedResult<R> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| SchedError::Database(e.to_string()))?;
        f(&mut conn)
    }

    fn init_schema_sync(&self) -> SchedResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 20),
                    created_at INTEGER NOT NULL,
                    data TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_jobs_order ON jobs(priority, created_at);

                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    scheduled_time INTEGER NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    log TEXT,
                    FOREIGN KEY (job_id) REFERENCES jobs(id)
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_runs_job ON runs(job_id);
                "#,
            )?;
            Ok(())
        })
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> SchedResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| SchedError::Persistence(format!("timestamp out of range: {micros}")))
}

/// Status names from which `target` may be reached.
fn statuses_before<S: Copy>(all: &[S], target: S, allowed: impl Fn(S, S) -> bool) -> Vec<S> {
    all.iter().copied().filter(|s| allowed(*s, target)).collect()
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(row: &Row<'_>) -> SchedResult<Job> {
    let data: String = row.get(0)?;
    let status: String = row.get(1)?;
    let mut job: Job = serde_json::from_str(&data)?;
    // The status column is authoritative; the JSON copy is the insert-time value.
    job.status = JobStatus::from_name(&status)
        .ok_or_else(|| SchedError::Persistence(format!("unknown job status '{status}'")))?;
    Ok(job)
}

fn run_from_row(row: &Row<'_>) -> SchedResult<JobRun> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let scheduled_time: i64 = row.get(2)?;
    let status: String = row.get(3)?;
    let log: Option<String> = row.get(4)?;

    Ok(JobRun {
        id: RunId::parse(&id).map_err(|e| SchedError::Persistence(e.to_string()))?,
        job_id: JobId::parse(&job_id).map_err(|e| SchedError::Persistence(e.to_string()))?,
        scheduled_time: from_micros(scheduled_time)?,
        status: RunStatus::from_name(&status)
            .ok_or_else(|| SchedError::Persistence(format!("unknown run status '{status}'")))?,
        log,
    })
}

fn load_run_sync(conn: &Connection, run_id: &RunId) -> SchedResult<Option<JobRun>> {
    let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
    let mut rows = stmt.query(rusqlite::params![run_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(run_from_row(row)?)),
        None => Ok(None),
    }
}

fn insert_run_sync(conn: &Connection, run: &JobRun) -> SchedResult<()> {
    conn.execute(
        &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
        rusqlite::params![
            run.id.to_string(),
            run.job_id.to_string(),
            to_micros(run.scheduled_time),
            run.status.name(),
            run.log,
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SchedError::Persistence(format!(
                "scheduled time {} already taken",
                run.scheduled_time.to_rfc3339()
            ))
        }
        other => other.into(),
    })?;
    Ok(())
}

const ALL_JOB_STATUSES: [JobStatus; 3] = [
    JobStatus::Submitted,
    JobStatus::Processing,
    JobStatus::Processed,
];

const ALL_RUN_STATUSES: [RunStatus; 5] = [
    RunStatus::Pending,
    RunStatus::Processing,
    RunStatus::Done,
    RunStatus::Failed,
    RunStatus::Cancelled,
];

#[async_trait]
impl StateStore for SqliteStore {
    async fn insert_job(&self, job: &Job) -> SchedResult<()> {
        job.validate()?;
        let data = serde_json::to_string(job)?;

        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO jobs (id, status, priority, created_at, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                rusqlite::params![
                    job.id.to_string(),
                    job.status.name(),
                    job.priority.value(),
                    to_micros(job.created_at),
                    data,
                ],
            )?;
            Ok(())
        })
    }

    async fn load_job(&self, job_id: &JobId) -> SchedResult<Option<Job>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT data, status FROM jobs WHERE id = ?1")?;
            let mut rows = stmt.query(rusqlite::params![job_id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(job_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    async fn list_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<Job>> {
        self.with_conn(|conn| {
            // Build query based on filter
            let mut sql = String::from("SELECT data, status FROM jobs WHERE 1=1");
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(ref statuses) = filter.status {
                sql.push_str(&format!(
                    " AND status IN ({})",
                    placeholders(params.len() + 1, statuses.len())
                ));
                for s in statuses {
                    params.push(Box::new(s.name()));
                }
            }

            if let Some(max_priority) = filter.max_priority {
                sql.push_str(&format!(" AND priority <= ?{}", params.len() + 1));
                params.push(Box::new(max_priority.value()));
            }

            // Lower value first, then submission order.
            sql.push_str(" ORDER BY priority ASC, created_at ASC, rowid ASC");

            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT ?{}", params.len() + 1));
                params.push(Box::new(limit as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|b| b.as_ref()).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;

            let mut jobs = Vec::new();
            while let Some(row) = rows.next()? {
                jobs.push(job_from_row(row)?);
            }
            Ok(jobs)
        })
    }

    async fn update_job_status(&self, job_id: &JobId, status: JobStatus) -> SchedResult<bool> {
        let from = statuses_before(&ALL_JOB_STATUSES, status, |a, b| a.can_transition_to(b));
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE jobs SET status = ?1 WHERE id = ?2 AND status IN ({})",
                placeholders(3, from.len())
            );
            let mut params: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(status.name()), Box::new(job_id.to_string())];
            params.extend(from.iter().map(|s| Box::new(s.name()) as Box<dyn rusqlite::ToSql>));
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|b| b.as_ref()).collect();

            let updated = conn.execute(&sql, params_refs.as_slice())?;
            if updated == 0 {
                let exists = conn
                    .query_row(
                        "SELECT 1 FROM jobs WHERE id = ?1",
                        rusqlite::params![job_id.to_string()],
                        |_| Ok(()),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(SchedError::JobNotFound(job_id.to_string()));
                }
            }
            Ok(updated > 0)
        })
    }

    async fn promote_job(
        &self,
        job_id: &JobId,
        scheduled_time: DateTime<Utc>,
    ) -> SchedResult<Option<JobRun>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE jobs SET status = ?1 WHERE id = ?2 AND status = ?3",
                rusqlite::params![
                    JobStatus::Processing.name(),
                    job_id.to_string(),
                    JobStatus::Submitted.name(),
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }

            let run = JobRun::new(*job_id, scheduled_time);
            insert_run_sync(&tx, &run)?;
            tx.commit()?;
            Ok(Some(run))
        })
    }

    async fn insert_run(&self, run: &JobRun) -> SchedResult<()> {
        self.with_conn(|conn| insert_run_sync(conn, run))
    }

    async fn load_run(&self, run_id: &RunId) -> SchedResult<Option<JobRun>> {
        self.with_conn(|conn| load_run_sync(conn, run_id))
    }

    async fn run_for_job(&self, job_id: &JobId) -> SchedResult<Option<JobRun>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE job_id = ?1 \
                 ORDER BY scheduled_time DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(rusqlite::params![job_id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(run_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    async fn list_runs(&self, filter: &RunFilter) -> SchedResult<Vec<JobRun>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1=1");
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(ref statuses) = filter.status {
                sql.push_str(&format!(
                    " AND status IN ({})",
                    placeholders(params.len() + 1, statuses.len())
                ));
                for s in statuses {
                    params.push(Box::new(s.name()));
                }
            }

            if let Some(job_id) = filter.job_id {
                sql.push_str(&format!(" AND job_id = ?{}", params.len() + 1));
                params.push(Box::new(job_id.to_string()));
            }

            sql.push_str(" ORDER BY scheduled_time ASC");

            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT ?{}", params.len() + 1));
                params.push(Box::new(limit as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|b| b.as_ref()).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;

            let mut runs = Vec::new();
            while let Some(row) = rows.next()? {
                runs.push(run_from_row(row)?);
            }
            Ok(runs)
        })
    }

    async fn update_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        log: Option<&str>,
    ) -> SchedResult<Option<JobRun>> {
        let from = statuses_before(&ALL_RUN_STATUSES, status, |a, b| a.can_transition_to(b));
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE runs SET status = ?1, log = COALESCE(?2, log) \
                 WHERE id = ?3 AND status IN ({})",
                placeholders(4, from.len())
            );
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(status.name()),
                Box::new(log.map(str::to_string)),
                Box::new(run_id.to_string()),
            ];
            params.extend(from.iter().map(|s| Box::new(s.name()) as Box<dyn rusqlite::ToSql>));
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|b| b.as_ref()).collect();

            let updated = conn.execute(&sql, params_refs.as_slice())?;
            if updated == 0 {
                return match load_run_sync(conn, run_id)? {
                    Some(_) => Ok(None),
                    None => Err(SchedError::RunNotFound(run_id.to_string())),
                };
            }
            load_run_sync(conn, run_id)
        })
    }

    async fn latest_scheduled_time(&self) -> SchedResult<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let latest: Option<i64> =
                conn.query_row("SELECT MAX(scheduled_time) FROM runs", [], |row| row.get(0))?;
            latest.map(from_micros).transpose()
        })
    }
}
