//! Shared per-party services.

use std::sync::Arc;

use crate::config::Config;
use crate::dag::{PartyRef, TaskGraph};
use crate::engine::EngineRegistry;
use crate::error::{Error, JobError};
use crate::federation::FederatedClient;
use crate::store::{Database, Job, JobFilter, JobKey, Task, TaskFilter, latest_versions};

/// Everything a component of one party needs. Built once at startup.
pub struct PartyContext {
    pub config: Arc<Config>,
    pub db: Arc<dyn Database>,
    pub engines: Arc<EngineRegistry>,
    pub client: FederatedClient,
}

impl PartyContext {
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn Database>,
        engines: Arc<EngineRegistry>,
        client: FederatedClient,
    ) -> Self {
        Self {
            config,
            db,
            engines,
            client,
        }
    }

    pub fn party_id(&self) -> &str {
        &self.config.party_id
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// One party's record of a job.
    pub async fn job(&self, job_id: &str, party: &PartyRef) -> Result<Job, Error> {
        self.db
            .get_job(&JobKey::new(job_id, party))
            .await?
            .ok_or_else(|| {
                JobError::NotFound {
                    id: job_id.to_string(),
                }
                .into()
            })
    }

    /// Any record of a job held here. On the scheduling party all records
    /// share the job-wide fields.
    pub async fn any_job(&self, job_id: &str) -> Result<Job, Error> {
        self.db
            .query_jobs(&JobFilter::job(job_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                JobError::NotFound {
                    id: job_id.to_string(),
                }
                .into()
            })
    }

    pub fn graph(&self, job: &Job) -> Result<TaskGraph, Error> {
        Ok(TaskGraph::build(job.dag.clone())?)
    }

    /// Latest version of every task record of the job held here.
    pub async fn latest_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error> {
        Ok(latest_versions(self.db.query_tasks(filter).await?))
    }
}
