//! Federated resource apply and return.
//!
//! Apply is all-or-nothing across the parties of a job or task: when any
//! party denies or cannot be reached, the parties that did grant are told to
//! return before the apply is reported as denied.

use tracing::{error, info};

use crate::dag::PartyRef;
use crate::error::{Error, JobError};
use crate::federation::{Command, FedRequest, FederatedClient, FederatedResult};
use crate::store::{Job, Task};

pub struct ResourceManager {
    client: FederatedClient,
}

impl ResourceManager {
    pub fn new(client: FederatedClient) -> Self {
        Self { client }
    }

    /// Reserve job cores at every party of the job.
    pub async fn apply_for_job(&self, job: &Job) -> Result<bool, Error> {
        let parties = job.parties();
        let result = self
            .client
            .send_to_parties(Command::JobResourceApply, &job.job_id, &parties, |r| r)
            .await;
        if result.is_success() {
            return Ok(true);
        }
        info!(job_id = %job.job_id, detail = %result.detail(), "Job resource apply failed, rolling back");
        self.rollback(&job.job_id, Command::JobResourceReturn, &result, |r| r)
            .await?;
        Ok(false)
    }

    pub async fn return_for_job(&self, job: &Job) -> FederatedResult {
        self.client
            .send_to_parties(Command::JobResourceReturn, &job.job_id, &job.parties(), |r| r)
            .await
    }

    /// Draw task cores at every party running the task.
    pub async fn apply_for_task(&self, task: &Task, parties: &[PartyRef]) -> Result<bool, Error> {
        let with_task = |r: FedRequest| r.with_task(task.task_id.clone(), task.task_version);
        let result = self
            .client
            .send_to_parties(Command::TaskResourceApply, &task.job_id, parties, with_task)
            .await;
        if result.is_success() {
            return Ok(true);
        }
        info!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            task_version = task.task_version,
            detail = %result.detail(),
            "Task resource apply failed, rolling back"
        );
        self.rollback(&task.job_id, Command::TaskResourceReturn, &result, with_task)
            .await?;
        Ok(false)
    }

    pub async fn return_for_task(&self, task: &Task, parties: &[PartyRef]) -> FederatedResult {
        self.client
            .send_to_parties(Command::TaskResourceReturn, &task.job_id, parties, |r| {
                r.with_task(task.task_id.clone(), task.task_version)
            })
            .await
    }

    async fn rollback<F>(
        &self,
        job_id: &str,
        command: Command,
        applied: &FederatedResult,
        prepare: F,
    ) -> Result<(), Error>
    where
        F: Fn(FedRequest) -> FedRequest,
    {
        let granted = applied.succeeded();
        if granted.is_empty() {
            return Ok(());
        }
        let result = self
            .client
            .send_to_parties(command, job_id, &granted, prepare)
            .await;
        if !result.is_success() {
            error!(job_id, command = %command, detail = %result.detail(), "Resource rollback failed");
            return Err(JobError::FederationFailed {
                id: job_id.to_string(),
                command: command.to_string(),
                detail: result.detail(),
            }
            .into());
        }
        Ok(())
    }
}
