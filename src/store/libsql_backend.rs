//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every conditional write is a
//! single `UPDATE ... WHERE <guard>` statement; the affected-row count tells
//! the caller whether it won.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info, warn};

use crate::dag::PartyRef;
use crate::error::DatabaseError;
use crate::status::{Status, TransitionMode, allowed_sources};
use crate::store::migrations;
use crate::store::model::{
    EnginePool, Job, JobFilter, JobKey, JobUpdate, StatusField, Task, TaskFilter, TaskKey,
    TaskUpdate,
};
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn execute(&self, op: &str, sql: &str, values: Vec<Value>) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
    }

    async fn fetch_jobs(&self, op: &str, sql: &str, values: Vec<Value>) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn fetch_tasks(&self, op: &str, sql: &str, values: Vec<Value>) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width, so text comparison orders instants.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Text(ts(dt)),
        None => Value::Null,
    }
}

fn flag(b: bool) -> i64 {
    if b { 1 } else { 0 }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("column {column}: {e}")))
}

fn parse_status(column: &str, raw: &str) -> Result<Status, DatabaseError> {
    raw.parse()
        .map_err(|e| DatabaseError::Serialization(format!("column {column}: {e}")))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("row parse (column {idx}): {e}")))
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("row parse (column {idx}): {e}")))
}

/// `?, ?, ...` with one placeholder per status, values appended to `values`.
fn status_list(statuses: &[Status], values: &mut Vec<Value>) -> String {
    let marks: Vec<&str> = statuses
        .iter()
        .map(|s| {
            values.push(Value::Text(s.as_str().to_string()));
            "?"
        })
        .collect();
    marks.join(", ")
}

/// Appends `AND role = ? AND party_id = ?` when a party is given.
fn party_clause(party: Option<&PartyRef>, values: &mut Vec<Value>) -> &'static str {
    match party {
        Some(party) => {
            values.push(Value::Text(party.role.clone()));
            values.push(Value::Text(party.party_id.clone()));
            " AND role = ? AND party_id = ?"
        }
        None => "",
    }
}

/// `start_time` is stamped on the first move to `Running`, `end_time` on a
/// terminal status.
const STATUS_TIMES: &str = "start_time = CASE WHEN ?1 = 'running' AND start_time IS NULL THEN ?2 ELSE start_time END, \
     end_time = CASE WHEN ?1 IN ('success', 'pass', 'failed', 'canceled', 'timeout', 'rejected') THEN ?2 ELSE end_time END";

const JOB_COLUMNS: &str = "job_id, role, party_id, dag, roles, initiator_party_id, scheduler_party_id, status, \
     resource_in_use, cores, remaining_cores, cancel_signal, stop_status, rerun_signal, ready_signal, ready_time, \
     ready_lease_until, apply_resource_time, error_report, created_at, start_time, end_time, updated_at, queued_at";

const TASK_COLUMNS: &str = "task_id, task_version, role, party_id, job_id, task_name, component_ref, status, \
     party_status, dependent_tasks, scheduler_party_id, engine, task_cores, resource_in_use, auto_retries, \
     timeout_secs, worker_handle, worker_instance, kill_status, inputs, outputs, error_report, created_at, \
     start_time, end_time, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let dag: String = text(row, 3)?;
    let roles: String = text(row, 4)?;
    let status: String = text(row, 7)?;
    let stop_status: Option<String> = row.get(12).ok();
    let created: String = text(row, 19)?;
    let updated: String = text(row, 22)?;
    let queued: String = text(row, 23)?;
    Ok(Job {
        job_id: text(row, 0)?,
        role: text(row, 1)?,
        party_id: text(row, 2)?,
        dag: from_json("dag", &dag)?,
        roles: from_json("roles", &roles)?,
        initiator_party_id: text(row, 5)?,
        scheduler_party_id: text(row, 6)?,
        status: parse_status("status", &status)?,
        resource_in_use: int(row, 8)? != 0,
        cores: int(row, 9)? as u32,
        remaining_cores: int(row, 10)? as u32,
        cancel_signal: int(row, 11)? != 0,
        stop_status: stop_status
            .as_deref()
            .map(|s| parse_status("stop_status", s))
            .transpose()?,
        rerun_signal: int(row, 13)? != 0,
        ready_signal: int(row, 14)? != 0,
        ready_time: parse_optional_datetime(row.get(15).ok()),
        ready_lease_until: parse_optional_datetime(row.get(16).ok()),
        apply_resource_time: parse_optional_datetime(row.get(17).ok()),
        error_report: row.get(18).ok(),
        created_at: parse_datetime(&created),
        start_time: parse_optional_datetime(row.get(20).ok()),
        end_time: parse_optional_datetime(row.get(21).ok()),
        updated_at: parse_datetime(&updated),
        queued_at: parse_datetime(&queued),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let status: String = text(row, 7)?;
    let party_status: String = text(row, 8)?;
    let dependent_tasks: String = text(row, 9)?;
    let inputs: String = text(row, 19)?;
    let outputs: String = text(row, 20)?;
    let created: String = text(row, 22)?;
    let updated: String = text(row, 25)?;
    Ok(Task {
        task_id: text(row, 0)?,
        task_version: int(row, 1)? as u32,
        role: text(row, 2)?,
        party_id: text(row, 3)?,
        job_id: text(row, 4)?,
        task_name: text(row, 5)?,
        component_ref: text(row, 6)?,
        status: parse_status("status", &status)?,
        party_status: parse_status("party_status", &party_status)?,
        dependent_tasks: from_json("dependent_tasks", &dependent_tasks)?,
        scheduler_party_id: text(row, 10)?,
        engine: text(row, 11)?,
        task_cores: int(row, 12)? as u32,
        resource_in_use: int(row, 13)? != 0,
        auto_retries: int(row, 14)? as u32,
        timeout_secs: int(row, 15)? as u64,
        worker_handle: row.get(16).ok(),
        worker_instance: row.get(17).ok(),
        kill_status: int(row, 18)? != 0,
        inputs: from_json("inputs", &inputs)?,
        outputs: from_json("outputs", &outputs)?,
        error_report: row.get(21).ok(),
        created_at: parse_datetime(&created),
        start_time: parse_optional_datetime(row.get(23).ok()),
        end_time: parse_optional_datetime(row.get(24).ok()),
        updated_at: parse_datetime(&updated),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO jobs ({JOB_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
                ),
                params![
                    job.job_id.clone(),
                    job.role.clone(),
                    job.party_id.clone(),
                    to_json(&job.dag)?,
                    to_json(&job.roles)?,
                    job.initiator_party_id.clone(),
                    job.scheduler_party_id.clone(),
                    job.status.as_str(),
                    flag(job.resource_in_use),
                    job.cores as i64,
                    job.remaining_cores as i64,
                    flag(job.cancel_signal),
                    opt_text(job.stop_status.map(Status::as_str)),
                    flag(job.rerun_signal),
                    flag(job.ready_signal),
                    opt_ts(job.ready_time),
                    opt_ts(job.ready_lease_until),
                    opt_ts(job.apply_resource_time),
                    opt_text(job.error_report.as_deref()),
                    ts(job.created_at),
                    opt_ts(job.start_time),
                    opt_ts(job.end_time),
                    ts(job.updated_at),
                    ts(job.queued_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        debug!(job_id = %job.job_id, role = %job.role, party_id = %job.party_id, inserted = inserted > 0, "Job record created");
        Ok(inserted > 0)
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>, DatabaseError> {
        let jobs = self
            .fetch_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ? AND role = ? AND party_id = ?"),
                vec![
                    Value::Text(key.job_id.clone()),
                    Value::Text(key.role.clone()),
                    Value::Text(key.party_id.clone()),
                ],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1");
        let mut values = Vec::new();
        if let Some(job_id) = &filter.job_id {
            sql.push_str(" AND job_id = ?");
            values.push(Value::Text(job_id.clone()));
        }
        sql.push_str(party_clause(filter.party.as_ref(), &mut values));
        if let Some(party_id) = &filter.party_id {
            sql.push_str(" AND party_id = ?");
            values.push(Value::Text(party_id.clone()));
        }
        if let Some(scheduler) = &filter.scheduler_party_id {
            sql.push_str(" AND scheduler_party_id = ?");
            values.push(Value::Text(scheduler.clone()));
        }
        if !filter.statuses.is_empty() {
            let marks = status_list(&filter.statuses, &mut values);
            sql.push_str(&format!(" AND status IN ({marks})"));
        }
        if let Some(in_use) = filter.resource_in_use {
            sql.push_str(" AND resource_in_use = ?");
            values.push(Value::Integer(flag(in_use)));
        }
        if let Some(cancel) = filter.cancel_signal {
            sql.push_str(" AND cancel_signal = ?");
            values.push(Value::Integer(flag(cancel)));
        }
        if let Some(rerun) = filter.rerun_signal {
            sql.push_str(" AND rerun_signal = ?");
            values.push(Value::Integer(flag(rerun)));
        }
        sql.push_str(" ORDER BY created_at, rowid");
        self.fetch_jobs("query_jobs", &sql, values).await
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        party: Option<&PartyRef>,
        status: Status,
        mode: TransitionMode,
    ) -> Result<bool, DatabaseError> {
        let mut values = vec![
            Value::Text(status.as_str().to_string()),
            Value::Text(ts(Utc::now())),
            Value::Text(job_id.to_string()),
        ];
        let sources = status_list(&allowed_sources(status, mode), &mut values);
        let times = if mode == TransitionMode::Administrative && status == Status::Waiting {
            // Rerun reset: the job starts over and queues again.
            "start_time = NULL, end_time = NULL, queued_at = ?2".to_string()
        } else {
            STATUS_TIMES.to_string()
        };
        // Bare `?` placeholders continue numbering after `?3`.
        let mut sql = format!(
            "UPDATE jobs SET status = ?1, updated_at = ?2, {times} \
             WHERE job_id = ?3 AND status IN ({sources})"
        );
        sql.push_str(party_clause(party, &mut values));
        let changed = self.execute("update_job_status", &sql, values).await?;
        debug!(job_id, status = %status, changed, "Job status update");
        Ok(changed > 0)
    }

    async fn update_job(
        &self,
        job_id: &str,
        party: Option<&PartyRef>,
        update: &JobUpdate,
    ) -> Result<bool, DatabaseError> {
        let mut sets = vec!["updated_at = ?".to_string()];
        let mut values = vec![Value::Text(ts(Utc::now()))];
        if let Some(cancel) = update.cancel_signal {
            sets.push("cancel_signal = ?".into());
            values.push(Value::Integer(flag(cancel)));
        }
        if let Some(stop_status) = update.stop_status {
            sets.push("stop_status = ?".into());
            values.push(opt_text(stop_status.map(Status::as_str)));
        }
        if let Some(rerun) = update.rerun_signal {
            sets.push("rerun_signal = ?".into());
            values.push(Value::Integer(flag(rerun)));
        }
        if let Some(at) = update.apply_resource_time {
            sets.push("apply_resource_time = ?".into());
            values.push(Value::Text(ts(at)));
        }
        if let Some(report) = &update.error_report {
            sets.push("error_report = ?".into());
            values.push(Value::Text(report.clone()));
        }
        let mut sql = format!("UPDATE jobs SET {} WHERE job_id = ?", sets.join(", "));
        values.push(Value::Text(job_id.to_string()));
        sql.push_str(party_clause(party, &mut values));
        let changed = self.execute("update_job", &sql, values).await?;
        Ok(changed > 0)
    }

    async fn swap_job_resource_in_use(
        &self,
        key: &JobKey,
        in_use: bool,
        cores: u32,
    ) -> Result<bool, DatabaseError> {
        let now = ts(Utc::now());
        let changed = if in_use {
            self.execute(
                "swap_job_resource_in_use",
                "UPDATE jobs SET resource_in_use = 1, cores = ?1, remaining_cores = ?1, \
                 apply_resource_time = ?2, updated_at = ?2 \
                 WHERE job_id = ?3 AND role = ?4 AND party_id = ?5 AND resource_in_use = 0",
                vec![
                    Value::Integer(cores as i64),
                    Value::Text(now),
                    Value::Text(key.job_id.clone()),
                    Value::Text(key.role.clone()),
                    Value::Text(key.party_id.clone()),
                ],
            )
            .await?
        } else {
            self.execute(
                "swap_job_resource_in_use",
                "UPDATE jobs SET resource_in_use = 0, cores = 0, remaining_cores = 0, updated_at = ?1 \
                 WHERE job_id = ?2 AND role = ?3 AND party_id = ?4 AND resource_in_use = 1",
                vec![
                    Value::Text(now),
                    Value::Text(key.job_id.clone()),
                    Value::Text(key.role.clone()),
                    Value::Text(key.party_id.clone()),
                ],
            )
            .await?
        };
        Ok(changed > 0)
    }

    async fn take_job_cores(&self, key: &JobKey, cores: u32) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "take_job_cores",
                "UPDATE jobs SET remaining_cores = remaining_cores - ?1 \
                 WHERE job_id = ?2 AND role = ?3 AND party_id = ?4 \
                 AND resource_in_use = 1 AND remaining_cores >= ?1",
                vec![
                    Value::Integer(cores as i64),
                    Value::Text(key.job_id.clone()),
                    Value::Text(key.role.clone()),
                    Value::Text(key.party_id.clone()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn give_job_cores(&self, key: &JobKey, cores: u32) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "give_job_cores",
                "UPDATE jobs SET remaining_cores = MIN(cores, remaining_cores + ?1) \
                 WHERE job_id = ?2 AND role = ?3 AND party_id = ?4 AND resource_in_use = 1",
                vec![
                    Value::Integer(cores as i64),
                    Value::Text(key.job_id.clone()),
                    Value::Text(key.role.clone()),
                    Value::Text(key.party_id.clone()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn acquire_schedule_lock(
        &self,
        job_id: &str,
        lease: Duration,
    ) -> Result<Option<String>, DatabaseError> {
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let owner = uuid::Uuid::new_v4().to_string();
        let changed = self
            .execute(
                "acquire_schedule_lock",
                "UPDATE jobs SET ready_signal = 1, ready_owner = ?1, ready_time = ?2, ready_lease_until = ?3 \
                 WHERE job_id = ?4 AND ready_signal = 0",
                vec![
                    Value::Text(owner.clone()),
                    Value::Text(ts(now)),
                    Value::Text(ts(until)),
                    Value::Text(job_id.to_string()),
                ],
            )
            .await?;
        Ok((changed > 0).then_some(owner))
    }

    async fn release_schedule_lock(&self, job_id: &str, owner: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "release_schedule_lock",
                "UPDATE jobs SET ready_signal = 0, ready_owner = NULL, ready_time = NULL, ready_lease_until = NULL \
                 WHERE job_id = ?1 AND ready_signal = 1 AND ready_owner = ?2",
                vec![Value::Text(job_id.to_string()), Value::Text(owner.to_string())],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn clear_expired_schedule_locks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT job_id FROM jobs WHERE ready_signal = 1 AND ready_lease_until < ?1",
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_expired_schedule_locks: {e}")))?;

        let mut expired: Vec<String> = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            expired.push(text(&row, 0)?);
        }

        let mut cleared = Vec::new();
        for job_id in expired {
            // Guard on the lease again so a lock re-acquired meanwhile survives.
            let changed = self
                .execute(
                    "clear_expired_schedule_locks",
                    "UPDATE jobs SET ready_signal = 0, ready_owner = NULL, ready_time = NULL, ready_lease_until = NULL \
                     WHERE job_id = ?1 AND ready_signal = 1 AND ready_lease_until < ?2",
                    vec![Value::Text(job_id.clone()), Value::Text(ts(now))],
                )
                .await?;
            if changed > 0 {
                warn!(job_id = %job_id, "Cleared expired schedule lock");
                cleared.push(job_id);
            }
        }
        Ok(cleared)
    }

    async fn delete_job(&self, job_id: &str, party: Option<&PartyRef>) -> Result<usize, DatabaseError> {
        let mut task_values = vec![Value::Text(job_id.to_string())];
        let task_sql = format!(
            "DELETE FROM tasks WHERE job_id = ?{}",
            party_clause(party, &mut task_values)
        );
        let tasks = self.execute("delete_job", &task_sql, task_values).await?;

        let mut job_values = vec![Value::Text(job_id.to_string())];
        let job_sql = format!(
            "DELETE FROM jobs WHERE job_id = ?{}",
            party_clause(party, &mut job_values)
        );
        let jobs = self.execute("delete_job", &job_sql, job_values).await?;

        info!(job_id, jobs, tasks, "Job records deleted");
        Ok((jobs + tasks) as usize)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
                ),
                params![
                    task.task_id.clone(),
                    task.task_version as i64,
                    task.role.clone(),
                    task.party_id.clone(),
                    task.job_id.clone(),
                    task.task_name.clone(),
                    task.component_ref.clone(),
                    task.status.as_str(),
                    task.party_status.as_str(),
                    to_json(&task.dependent_tasks)?,
                    task.scheduler_party_id.clone(),
                    task.engine.clone(),
                    task.task_cores as i64,
                    flag(task.resource_in_use),
                    task.auto_retries as i64,
                    task.timeout_secs as i64,
                    opt_text(task.worker_handle.as_deref()),
                    opt_text(task.worker_instance.as_deref()),
                    flag(task.kill_status),
                    to_json(&task.inputs)?,
                    to_json(&task.outputs)?,
                    opt_text(task.error_report.as_deref()),
                    ts(task.created_at),
                    opt_ts(task.start_time),
                    opt_ts(task.end_time),
                    ts(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(task = %task.key(), inserted = inserted > 0, "Task record created");
        Ok(inserted > 0)
    }

    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>, DatabaseError> {
        let tasks = self
            .fetch_tasks(
                "get_task",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE task_id = ? AND task_version = ? AND role = ? AND party_id = ?"
                ),
                vec![
                    Value::Text(key.task_id.clone()),
                    Value::Integer(key.task_version as i64),
                    Value::Text(key.role.clone()),
                    Value::Text(key.party_id.clone()),
                ],
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1");
        let mut values = Vec::new();
        if let Some(job_id) = &filter.job_id {
            sql.push_str(" AND job_id = ?");
            values.push(Value::Text(job_id.clone()));
        }
        if let Some(task_id) = &filter.task_id {
            sql.push_str(" AND task_id = ?");
            values.push(Value::Text(task_id.clone()));
        }
        if let Some(version) = filter.task_version {
            sql.push_str(" AND task_version = ?");
            values.push(Value::Integer(version as i64));
        }
        sql.push_str(party_clause(filter.party.as_ref(), &mut values));
        if let Some(party_id) = &filter.party_id {
            sql.push_str(" AND party_id = ?");
            values.push(Value::Text(party_id.clone()));
        }
        if !filter.statuses.is_empty() {
            let marks = status_list(&filter.statuses, &mut values);
            sql.push_str(&format!(" AND status IN ({marks})"));
        }
        if !filter.party_statuses.is_empty() {
            let marks = status_list(&filter.party_statuses, &mut values);
            sql.push_str(&format!(" AND party_status IN ({marks})"));
        }
        if let Some(in_use) = filter.resource_in_use {
            sql.push_str(" AND resource_in_use = ?");
            values.push(Value::Integer(flag(in_use)));
        }
        if let Some(instance) = &filter.worker_instance {
            sql.push_str(" AND worker_instance = ?");
            values.push(Value::Text(instance.clone()));
        }
        sql.push_str(" ORDER BY rowid");
        self.fetch_tasks("query_tasks", &sql, values).await
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        task_version: u32,
        party: Option<&PartyRef>,
        field: StatusField,
        status: Status,
    ) -> Result<bool, DatabaseError> {
        let column = field.column();
        let mut values = vec![
            Value::Text(status.as_str().to_string()),
            Value::Text(ts(Utc::now())),
            Value::Text(task_id.to_string()),
            Value::Integer(task_version as i64),
        ];
        let sources = status_list(&allowed_sources(status, TransitionMode::Normal), &mut values);
        let times = match field {
            // Timestamps follow the party's own execution.
            StatusField::PartyStatus => format!(", {STATUS_TIMES}"),
            StatusField::Status => String::new(),
        };
        let mut sql = format!(
            "UPDATE tasks SET {column} = ?1, updated_at = ?2{times} \
             WHERE task_id = ?3 AND task_version = ?4 AND {column} IN ({sources})"
        );
        sql.push_str(party_clause(party, &mut values));
        let changed = self.execute("update_task_status", &sql, values).await?;
        debug!(task_id, version = task_version, column, status = %status, changed, "Task status update");
        Ok(changed > 0)
    }

    async fn update_task(&self, key: &TaskKey, update: &TaskUpdate) -> Result<bool, DatabaseError> {
        let mut sets = vec!["updated_at = ?".to_string()];
        let mut values = vec![Value::Text(ts(Utc::now()))];
        if let Some(handle) = &update.worker_handle {
            sets.push("worker_handle = ?".into());
            values.push(Value::Text(handle.clone()));
        }
        if let Some(instance) = &update.worker_instance {
            sets.push("worker_instance = ?".into());
            values.push(Value::Text(instance.clone()));
        }
        if let Some(kill) = update.kill_status {
            sets.push("kill_status = ?".into());
            values.push(Value::Integer(flag(kill)));
        }
        if let Some(inputs) = &update.inputs {
            sets.push("inputs = ?".into());
            values.push(Value::Text(to_json(inputs)?));
        }
        if let Some(outputs) = &update.outputs {
            sets.push("outputs = ?".into());
            values.push(Value::Text(to_json(outputs)?));
        }
        if let Some(report) = &update.error_report {
            sets.push("error_report = ?".into());
            values.push(Value::Text(report.clone()));
        }
        let mut sql = format!(
            "UPDATE tasks SET {} WHERE task_id = ? AND task_version = ? AND role = ? AND party_id = ?",
            sets.join(", ")
        );
        values.push(Value::Text(key.task_id.clone()));
        values.push(Value::Integer(key.task_version as i64));
        values.push(Value::Text(key.role.clone()));
        values.push(Value::Text(key.party_id.clone()));
        if !update.only_kill_status() {
            // Terminal records are history; only the kill flag may still change.
            let open: Vec<Status> = Status::ALL.into_iter().filter(|s| !s.is_terminal()).collect();
            let marks = status_list(&open, &mut values);
            sql.push_str(&format!(" AND party_status IN ({marks})"));
        }
        let changed = self.execute("update_task", &sql, values).await?;
        Ok(changed > 0)
    }

    async fn swap_task_resource_in_use(&self, key: &TaskKey, in_use: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "swap_task_resource_in_use",
                "UPDATE tasks SET resource_in_use = ?1, updated_at = ?2 \
                 WHERE task_id = ?3 AND task_version = ?4 AND role = ?5 AND party_id = ?6 \
                 AND resource_in_use = ?7",
                vec![
                    Value::Integer(flag(in_use)),
                    Value::Text(ts(Utc::now())),
                    Value::Text(key.task_id.clone()),
                    Value::Integer(key.task_version as i64),
                    Value::Text(key.role.clone()),
                    Value::Text(key.party_id.clone()),
                    Value::Integer(flag(!in_use)),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    // ── Engine pools ────────────────────────────────────────────────

    async fn ensure_engine_pool(&self, engine: &str, total_cores: u32) -> Result<(), DatabaseError> {
        self.execute(
            "ensure_engine_pool",
            "INSERT INTO engine_resources (engine, total_cores, remaining_cores, updated_at) \
             VALUES (?1, ?2, ?2, ?3) \
             ON CONFLICT(engine) DO UPDATE SET \
               remaining_cores = MAX(0, excluded.total_cores - (engine_resources.total_cores - engine_resources.remaining_cores)), \
               total_cores = excluded.total_cores, \
               updated_at = excluded.updated_at",
            vec![
                Value::Text(engine.to_string()),
                Value::Integer(total_cores as i64),
                Value::Text(ts(Utc::now())),
            ],
        )
        .await?;
        info!(engine, total_cores, "Engine pool registered");
        Ok(())
    }

    async fn get_engine_pool(&self, engine: &str) -> Result<Option<EnginePool>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT total_cores, remaining_cores FROM engine_resources WHERE engine = ?1",
                params![engine],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_engine_pool: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(EnginePool {
                total_cores: int(&row, 0)? as u32,
                remaining_cores: int(&row, 1)? as u32,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_engine_pool: {e}"))),
        }
    }

    async fn take_engine_cores(&self, engine: &str, cores: u32) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "take_engine_cores",
                "UPDATE engine_resources SET remaining_cores = remaining_cores - ?1, updated_at = ?2 \
                 WHERE engine = ?3 AND remaining_cores >= ?1",
                vec![
                    Value::Integer(cores as i64),
                    Value::Text(ts(Utc::now())),
                    Value::Text(engine.to_string()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn give_engine_cores(&self, engine: &str, cores: u32) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "give_engine_cores",
                "UPDATE engine_resources SET remaining_cores = MIN(total_cores, remaining_cores + ?1), \
                 updated_at = ?2 WHERE engine = ?3",
                vec![
                    Value::Integer(cores as i64),
                    Value::Text(ts(Utc::now())),
                    Value::Text(engine.to_string()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DagSchema, TaskGraph};
    use crate::store::model::RerunCause;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn guest() -> PartyRef {
        PartyRef::new("guest", "9999")
    }

    fn host() -> PartyRef {
        PartyRef::new("host", "10000")
    }

    fn dag() -> DagSchema {
        DagSchema::from_json(
            r#"{
                "parties": [{"role": "guest", "party_id": ["9999"]}, {"role": "host", "party_id": ["10000"]}],
                "tasks": {
                    "reader": {"component_ref": "reader", "outputs": ["data"]},
                    "train": {"component_ref": "lr", "dependent_tasks": ["reader"]}
                }
            }"#,
        )
        .unwrap()
    }

    async fn seed_job(db: &LibSqlBackend, job_id: &str) -> Job {
        let mut first = None;
        for party in [guest(), host()] {
            let job = Job::new(job_id, &party, dag(), "9999", "9999");
            assert!(db.create_job(&job).await.unwrap());
            first.get_or_insert(job);
        }
        first.unwrap()
    }

    async fn seed_task(db: &LibSqlBackend, job: &Job, name: &str, party: &PartyRef) -> Task {
        let graph = TaskGraph::build(job.dag.clone()).unwrap();
        let task = Task::from_graph(job, &graph, name, party, 0);
        assert!(db.create_task(&task).await.unwrap());
        task
    }

    // ── Job tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get_job() {
        let db = test_db().await;
        let job = seed_job(&db, "j1").await;

        let fetched = db.get_job(&job.key()).await.unwrap().unwrap();
        assert_eq!(fetched.job_id, "j1");
        assert_eq!(fetched.status, Status::Waiting);
        assert_eq!(fetched.roles["host"], vec!["10000"]);
        assert_eq!(fetched.dag.tasks.len(), 2);
        assert!(fetched.stop_status.is_none());

        // Duplicate insert is reported, not an error.
        assert!(!db.create_job(&job).await.unwrap());
        assert_eq!(db.query_jobs(&JobFilter::job("j1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn get_job_not_found() {
        let db = test_db().await;
        let key = JobKey::new("missing", &guest());
        assert!(db.get_job(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_status_is_conditional() {
        let db = test_db().await;
        seed_job(&db, "j1").await;
        let g = guest();

        assert!(db.update_job_status("j1", Some(&g), Status::Running, TransitionMode::Normal).await.unwrap());
        assert!(db.update_job_status("j1", Some(&g), Status::Success, TransitionMode::Normal).await.unwrap());
        // Terminal is final for regular writes.
        assert!(!db.update_job_status("j1", Some(&g), Status::Running, TransitionMode::Normal).await.unwrap());
        assert!(!db.update_job_status("j1", Some(&g), Status::Failed, TransitionMode::Normal).await.unwrap());

        let job = db.get_job(&JobKey::new("j1", &g)).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Success);
        assert!(job.start_time.is_some());
        assert!(job.end_time.is_some());

        // The host record was untouched.
        let other = db.get_job(&JobKey::new("j1", &host())).await.unwrap().unwrap();
        assert_eq!(other.status, Status::Waiting);
    }

    #[tokio::test]
    async fn administrative_stop_and_reset() {
        let db = test_db().await;
        seed_job(&db, "j1").await;

        assert!(db.update_job_status("j1", None, Status::Success, TransitionMode::Normal).await.unwrap());
        assert!(db.update_job_status("j1", None, Status::Canceled, TransitionMode::Administrative).await.unwrap());
        assert!(db.update_job_status("j1", None, Status::Waiting, TransitionMode::Administrative).await.unwrap());

        let jobs = db.query_jobs(&JobFilter::job("j1")).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == Status::Waiting && j.end_time.is_none()));
    }

    #[tokio::test]
    async fn update_job_fields_and_filters() {
        let db = test_db().await;
        seed_job(&db, "j1").await;
        seed_job(&db, "j2").await;

        let update = JobUpdate {
            cancel_signal: Some(true),
            stop_status: Some(Some(Status::Timeout)),
            ..Default::default()
        };
        assert!(db.update_job("j1", None, &update).await.unwrap());

        let filter = JobFilter {
            cancel_signal: Some(true),
            ..Default::default()
        };
        let canceled = db.query_jobs(&filter).await.unwrap();
        assert_eq!(canceled.len(), 2);
        assert!(canceled.iter().all(|j| j.stop_status == Some(Status::Timeout)));

        let filter = JobFilter {
            party: Some(host()),
            statuses: vec![Status::Waiting],
            ..Default::default()
        };
        assert_eq!(db.query_jobs(&filter).await.unwrap().len(), 2);

        let clear = JobUpdate {
            stop_status: Some(None),
            ..Default::default()
        };
        db.update_job("j1", Some(&guest()), &clear).await.unwrap();
        let job = db.get_job(&JobKey::new("j1", &guest())).await.unwrap().unwrap();
        assert!(job.stop_status.is_none());
    }

    #[tokio::test]
    async fn schedule_lock_is_exclusive() {
        let db = Arc::new(test_db().await);
        seed_job(&db, "j1").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.acquire_schedule_lock("j1", Duration::from_secs(60)).await.unwrap()
            }));
        }
        let mut owners = Vec::new();
        for handle in handles {
            if let Some(owner) = handle.await.unwrap() {
                owners.push(owner);
            }
        }
        assert_eq!(owners.len(), 1);

        assert!(db.release_schedule_lock("j1", &owners[0]).await.unwrap());
        assert!(!db.release_schedule_lock("j1", &owners[0]).await.unwrap());
        assert!(db.acquire_schedule_lock("j1", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_locks_are_cleared() {
        let db = test_db().await;
        seed_job(&db, "j1").await;
        seed_job(&db, "j2").await;

        assert!(db.acquire_schedule_lock("j1", Duration::from_secs(1)).await.unwrap().is_some());
        assert!(db.acquire_schedule_lock("j2", Duration::from_secs(3600)).await.unwrap().is_some());

        let later = Utc::now() + chrono::Duration::seconds(10);
        let cleared = db.clear_expired_schedule_locks(later).await.unwrap();
        assert_eq!(cleared, vec!["j1".to_string()]);

        assert!(db.acquire_schedule_lock("j1", Duration::from_secs(60)).await.unwrap().is_some());
        assert!(db.acquire_schedule_lock("j2", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_owner_cannot_release_reacquired_lock() {
        let db = test_db().await;
        seed_job(&db, "j1").await;

        let first = db
            .acquire_schedule_lock("j1", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(db.clear_expired_schedule_locks(later).await.unwrap(), vec!["j1".to_string()]);

        let second = db
            .acquire_schedule_lock("j1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first, second);

        // The expired holder finishing late leaves the new holder's lock alone.
        assert!(!db.release_schedule_lock("j1", &first).await.unwrap());
        assert!(db.acquire_schedule_lock("j1", Duration::from_secs(60)).await.unwrap().is_none());

        assert!(db.release_schedule_lock("j1", &second).await.unwrap());
        assert!(db.acquire_schedule_lock("j1", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn job_resource_swap_is_exactly_once() {
        let db = test_db().await;
        let job = seed_job(&db, "j1").await;
        let key = job.key();

        assert!(db.swap_job_resource_in_use(&key, true, 4).await.unwrap());
        assert!(!db.swap_job_resource_in_use(&key, true, 4).await.unwrap());

        assert!(db.take_job_cores(&key, 3).await.unwrap());
        assert!(!db.take_job_cores(&key, 2).await.unwrap());
        assert!(db.give_job_cores(&key, 3).await.unwrap());
        let fetched = db.get_job(&key).await.unwrap().unwrap();
        assert_eq!(fetched.cores, 4);
        assert_eq!(fetched.remaining_cores, 4);
        assert!(fetched.apply_resource_time.is_some());

        assert!(db.swap_job_resource_in_use(&key, false, 0).await.unwrap());
        assert!(!db.swap_job_resource_in_use(&key, false, 0).await.unwrap());
        assert!(!db.take_job_cores(&key, 1).await.unwrap());
    }

    #[tokio::test]
    async fn delete_job_removes_tasks() {
        let db = test_db().await;
        let job = seed_job(&db, "j1").await;
        seed_task(&db, &job, "reader", &guest()).await;
        seed_task(&db, &job, "reader", &host()).await;

        let deleted = db.delete_job("j1", Some(&host())).await.unwrap();
        assert_eq!(deleted, 2);
        let deleted = db.delete_job("j1", None).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(db.query_jobs(&JobFilter::job("j1")).await.unwrap().is_empty());
        assert!(db.query_tasks(&TaskFilter::job("j1")).await.unwrap().is_empty());
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_query_tasks() {
        let db = test_db().await;
        let job = seed_job(&db, "j1").await;
        let task = seed_task(&db, &job, "train", &guest()).await;
        assert!(!db.create_task(&task).await.unwrap());

        let fetched = db.get_task(&task.key()).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, "j1_train");
        assert_eq!(fetched.dependent_tasks, vec!["reader"]);
        assert_eq!(fetched.party_status, Status::Waiting);

        let next = fetched.next_version(1, RerunCause::Manual);
        assert!(db.create_task(&next).await.unwrap());
        let filter = TaskFilter {
            task_id: Some("j1_train".into()),
            ..Default::default()
        };
        let versions: Vec<u32> = db
            .query_tasks(&filter)
            .await
            .unwrap()
            .iter()
            .map(|t| t.task_version)
            .collect();
        assert_eq!(versions, vec![0, 1]);

        // The old version is untouched by the new row.
        let old = db.get_task(&task.key()).await.unwrap().unwrap();
        assert_eq!(old.task_version, 0);
    }

    #[tokio::test]
    async fn task_status_never_regresses() {
        let db = test_db().await;
        let job = seed_job(&db, "j1").await;
        let task = seed_task(&db, &job, "reader", &guest()).await;
        let g = guest();

        assert!(db.update_task_status(&task.task_id, 0, Some(&g), StatusField::PartyStatus, Status::Running).await.unwrap());
        assert!(db.update_task_status(&task.task_id, 0, Some(&g), StatusField::PartyStatus, Status::Failed).await.unwrap());
        assert!(!db.update_task_status(&task.task_id, 0, Some(&g), StatusField::PartyStatus, Status::Running).await.unwrap());
        assert!(!db.update_task_status(&task.task_id, 0, Some(&g), StatusField::PartyStatus, Status::Success).await.unwrap());

        assert!(db.update_task_status(&task.task_id, 0, None, StatusField::Status, Status::Running).await.unwrap());

        let fetched = db.get_task(&task.key()).await.unwrap().unwrap();
        assert_eq!(fetched.party_status, Status::Failed);
        assert_eq!(fetched.status, Status::Running);
        assert!(fetched.end_time.is_some());
    }

    #[tokio::test]
    async fn terminal_task_only_accepts_kill_flag() {
        let db = test_db().await;
        let job = seed_job(&db, "j1").await;
        let task = seed_task(&db, &job, "reader", &guest()).await;
        let key = task.key();

        let launch = TaskUpdate {
            worker_handle: Some("1234".into()),
            worker_instance: Some("node-a".into()),
            ..Default::default()
        };
        assert!(db.update_task(&key, &launch).await.unwrap());

        db.update_task_status(&task.task_id, 0, Some(&guest()), StatusField::PartyStatus, Status::Success)
            .await
            .unwrap();

        let late = TaskUpdate {
            error_report: Some("late".into()),
            ..Default::default()
        };
        assert!(!db.update_task(&key, &late).await.unwrap());
        let kill = TaskUpdate {
            kill_status: Some(true),
            ..Default::default()
        };
        assert!(db.update_task(&key, &kill).await.unwrap());

        let fetched = db.get_task(&key).await.unwrap().unwrap();
        assert!(fetched.kill_status);
        assert!(fetched.error_report.is_none());
        assert_eq!(fetched.worker_handle.as_deref(), Some("1234"));

        let filter = TaskFilter {
            worker_instance: Some("node-a".into()),
            party_statuses: vec![Status::Success],
            ..Default::default()
        };
        assert_eq!(db.query_tasks(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_resource_swap_is_exactly_once() {
        let db = test_db().await;
        let job = seed_job(&db, "j1").await;
        let key = seed_task(&db, &job, "reader", &guest()).await.key();

        assert!(!db.swap_task_resource_in_use(&key, false).await.unwrap());
        assert!(db.swap_task_resource_in_use(&key, true).await.unwrap());
        assert!(!db.swap_task_resource_in_use(&key, true).await.unwrap());
        assert!(db.swap_task_resource_in_use(&key, false).await.unwrap());
    }

    // ── Engine pool tests ───────────────────────────────────────────

    #[tokio::test]
    async fn engine_pool_accounting() {
        let db = test_db().await;
        db.ensure_engine_pool("process", 8).await.unwrap();

        assert!(db.take_engine_cores("process", 6).await.unwrap());
        assert!(!db.take_engine_cores("process", 3).await.unwrap());
        assert!(!db.take_engine_cores("unknown", 1).await.unwrap());

        // Resizing keeps the cores in use accounted for.
        db.ensure_engine_pool("process", 10).await.unwrap();
        let pool = db.get_engine_pool("process").await.unwrap().unwrap();
        assert_eq!(pool, EnginePool { total_cores: 10, remaining_cores: 4 });

        assert!(db.give_engine_cores("process", 6).await.unwrap());
        assert!(db.give_engine_cores("process", 6).await.unwrap());
        let pool = db.get_engine_pool("process").await.unwrap().unwrap();
        assert_eq!(pool.remaining_cores, 10);
    }

    #[tokio::test]
    async fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fedflow.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            seed_job(&db, "j1").await;
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.query_jobs(&JobFilter::job("j1")).await.unwrap().len(), 2);
    }
}
