//! Unified `Database` trait: single async interface for job/task persistence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dag::PartyRef;
use crate::error::DatabaseError;
use crate::status::{Status, TransitionMode};
use crate::store::model::{
    EnginePool, Job, JobFilter, JobKey, JobUpdate, StatusField, Task, TaskFilter, TaskKey,
    TaskUpdate,
};

/// Backend-agnostic store for jobs, tasks and engine core pools.
///
/// Every status write is conditional: it succeeds only when the row's current
/// status is an allowed predecessor of the new one. A rejected write returns
/// `Ok(false)`; callers treat it as "someone else already updated it".
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a job record. Returns `false` if it already exists.
    async fn create_job(&self, job: &Job) -> Result<bool, DatabaseError>;

    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>, DatabaseError>;

    /// Query job records, oldest first.
    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;

    /// Conditionally set the status of one record (`party = Some`) or of every
    /// record of the job held here (`party = None`).
    async fn update_job_status(
        &self,
        job_id: &str,
        party: Option<&PartyRef>,
        status: Status,
        mode: TransitionMode,
    ) -> Result<bool, DatabaseError>;

    async fn update_job(
        &self,
        job_id: &str,
        party: Option<&PartyRef>,
        update: &JobUpdate,
    ) -> Result<bool, DatabaseError>;

    /// Flip `resource_in_use` from `!in_use` to `in_use`. Applying records the
    /// reserved `cores`; returning empties the reservation.
    async fn swap_job_resource_in_use(
        &self,
        key: &JobKey,
        in_use: bool,
        cores: u32,
    ) -> Result<bool, DatabaseError>;

    /// Take `cores` from the job's remaining reservation.
    async fn take_job_cores(&self, key: &JobKey, cores: u32) -> Result<bool, DatabaseError>;

    /// Give `cores` back to the job's remaining reservation.
    async fn give_job_cores(&self, key: &JobKey, cores: u32) -> Result<bool, DatabaseError>;

    /// Set the schedule lock of the job if it is free. Exactly one concurrent
    /// caller wins and receives the owner token; the others get `None`.
    async fn acquire_schedule_lock(
        &self,
        job_id: &str,
        lease: Duration,
    ) -> Result<Option<String>, DatabaseError>;

    /// Release the lock only while `owner` still holds it.
    async fn release_schedule_lock(&self, job_id: &str, owner: &str) -> Result<bool, DatabaseError>;

    /// Clear locks whose lease ended before `now`. Returns the affected job ids.
    async fn clear_expired_schedule_locks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Delete job and task records of the job held here (all parties when
    /// `party` is `None`). Returns the number of deleted rows.
    async fn delete_job(&self, job_id: &str, party: Option<&PartyRef>) -> Result<usize, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task record. Returns `false` if it already exists.
    async fn create_task(&self, task: &Task) -> Result<bool, DatabaseError>;

    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>, DatabaseError>;

    /// Query task records ordered by creation.
    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError>;

    /// Conditionally set one status column of a task version, for one party
    /// or for every party record held here.
    async fn update_task_status(
        &self,
        task_id: &str,
        task_version: u32,
        party: Option<&PartyRef>,
        field: StatusField,
        status: Status,
    ) -> Result<bool, DatabaseError>;

    async fn update_task(&self, key: &TaskKey, update: &TaskUpdate) -> Result<bool, DatabaseError>;

    /// Flip `resource_in_use` from `!in_use` to `in_use`.
    async fn swap_task_resource_in_use(&self, key: &TaskKey, in_use: bool) -> Result<bool, DatabaseError>;

    // ── Engine pools ────────────────────────────────────────────────

    /// Create the pool or resize it, keeping cores in use accounted for.
    async fn ensure_engine_pool(&self, engine: &str, total_cores: u32) -> Result<(), DatabaseError>;

    async fn get_engine_pool(&self, engine: &str) -> Result<Option<EnginePool>, DatabaseError>;

    /// Take `cores` from the pool if enough remain.
    async fn take_engine_cores(&self, engine: &str, cores: u32) -> Result<bool, DatabaseError>;

    async fn give_engine_cores(&self, engine: &str, cores: u32) -> Result<bool, DatabaseError>;
}
