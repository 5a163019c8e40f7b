//! Party-local resource ledger.
//!
//! Two levels: a job reserves `task_cores × task_parallelism` from the
//! engine's pool at this party, and each task version draws `task_cores`
//! from its job's reservation. The `resource_in_use` flag of a record flips
//! exactly once per apply and once per return, so repeated (retried)
//! commands are harmless.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::EngineRegistry;
use crate::error::{Error, JobError};
use crate::store::{Database, JobKey, TaskKey};

pub struct ResourceLedger {
    db: Arc<dyn Database>,
    engines: Arc<EngineRegistry>,
}

impl ResourceLedger {
    pub fn new(db: Arc<dyn Database>, engines: Arc<EngineRegistry>) -> Self {
        Self { db, engines }
    }

    /// Create or resize the pool of every registered engine that tracks
    /// resources.
    pub async fn ensure_pools(&self, total_cores: u32) -> Result<(), Error> {
        for name in self.engines.names().await {
            if self.engines.accounts_resources(&name).await {
                self.db.ensure_engine_pool(&name, total_cores).await?;
            }
        }
        Ok(())
    }

    /// Reserve the job's cores. Returns `false` when the pool is short.
    pub async fn apply_job(&self, key: &JobKey) -> Result<bool, Error> {
        let job = self.db.get_job(key).await?.ok_or_else(|| JobError::NotFound {
            id: key.job_id.clone(),
        })?;
        let engine = &job.dag.conf.engine;
        if !self.engines.accounts_resources(engine).await || job.resource_in_use {
            return Ok(true);
        }

        let cores = job.dag.conf.job_cores();
        if !self.db.take_engine_cores(engine, cores).await? {
            info!(job_id = %key.job_id, party_id = %key.party_id, engine = %engine, cores, "Job resource apply denied");
            return Ok(false);
        }
        if !self.db.swap_job_resource_in_use(key, true, cores).await? {
            // A concurrent apply won; hand our cores back.
            self.db.give_engine_cores(engine, cores).await?;
            return Ok(true);
        }
        debug!(job_id = %key.job_id, party_id = %key.party_id, cores, "Job resources applied");
        Ok(true)
    }

    /// Give the job's reservation back to the pool.
    pub async fn return_job(&self, key: &JobKey) -> Result<bool, Error> {
        let Some(job) = self.db.get_job(key).await? else {
            return Ok(false);
        };
        if !job.resource_in_use {
            return Ok(true);
        }
        let in_flight = job.cores.saturating_sub(job.remaining_cores);
        if in_flight > 0 {
            warn!(job_id = %key.job_id, party_id = %key.party_id, in_flight, "Returning job resources while tasks still hold cores");
        }
        if self.db.swap_job_resource_in_use(key, false, 0).await? {
            self.db.give_engine_cores(&job.dag.conf.engine, job.cores).await?;
            debug!(job_id = %key.job_id, party_id = %key.party_id, cores = job.cores, "Job resources returned");
        }
        Ok(true)
    }

    /// Draw the task's cores from its job's reservation.
    pub async fn apply_task(&self, key: &TaskKey) -> Result<bool, Error> {
        let task = self.db.get_task(key).await?.ok_or_else(|| JobError::TaskNotFound {
            task_id: key.task_id.clone(),
            version: key.task_version,
        })?;
        if !self.engines.accounts_resources(&task.engine).await || task.resource_in_use {
            return Ok(true);
        }

        let job_key = JobKey {
            job_id: task.job_id.clone(),
            role: task.role.clone(),
            party_id: task.party_id.clone(),
        };
        if !self.db.take_job_cores(&job_key, task.task_cores).await? {
            info!(task = %key, cores = task.task_cores, "Task resource apply denied");
            return Ok(false);
        }
        if !self.db.swap_task_resource_in_use(key, true).await? {
            self.db.give_job_cores(&job_key, task.task_cores).await?;
        }
        Ok(true)
    }

    /// Give the task's cores back to its job's reservation.
    pub async fn return_task(&self, key: &TaskKey) -> Result<bool, Error> {
        let Some(task) = self.db.get_task(key).await? else {
            return Ok(false);
        };
        if !task.resource_in_use {
            return Ok(true);
        }
        if self.db.swap_task_resource_in_use(key, false).await? {
            let job_key = JobKey {
                job_id: task.job_id.clone(),
                role: task.role.clone(),
                party_id: task.party_id.clone(),
            };
            // The job reservation may already be gone; nothing to refill then.
            self.db.give_job_cores(&job_key, task.task_cores).await?;
            debug!(task = %key, cores = task.task_cores, "Task resources returned");
        }
        Ok(true)
    }
}
