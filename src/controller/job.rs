//! Job lifecycle driven by the scheduling party.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::context::PartyContext;
use crate::controller::{PartyController, TaskController};
use crate::dag::{DagSchema, TaskGraph};
use crate::error::{Error, JobError};
use crate::federation::protocol::to_body;
use crate::federation::{Command, CreateJobBody, FederatedResult, StatusBody};
use crate::resource::ResourceManager;
use crate::status::{Status, TransitionMode};
use crate::store::{Job, JobUpdate, RerunCause, StatusField, Task, TaskFilter};

/// A job with the latest version of each of its tasks, as held here.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: Job,
    /// Per-party records keyed by task name.
    pub tasks: BTreeMap<String, Vec<Task>>,
}

pub struct JobController {
    ctx: Arc<PartyContext>,
    party: Arc<PartyController>,
    tasks: Arc<TaskController>,
    resources: Arc<ResourceManager>,
}

impl JobController {
    pub fn new(
        ctx: Arc<PartyContext>,
        party: Arc<PartyController>,
        tasks: Arc<TaskController>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        Self {
            ctx,
            party,
            tasks,
            resources,
        }
    }

    /// Validate a DAG and create the job at every party, with this party
    /// scheduling it. Either every party holds the job afterwards or none does.
    pub async fn create_job(&self, dag: DagSchema) -> Result<String, Error> {
        // Structural errors surface before any party is contacted.
        TaskGraph::build(dag.clone())?;

        let job_id = new_job_id();
        let parties = dag.job_parties();
        let body = CreateJobBody {
            dag,
            initiator_party_id: self.ctx.party_id().to_string(),
            scheduler_party_id: self.ctx.party_id().to_string(),
        };

        // Schedule view: the records of every party.
        for party in &parties {
            self.party.create_job(party, &job_id, body.clone()).await?;
        }

        let payload = to_body(&body);
        let result = self
            .ctx
            .client
            .send_to_parties(Command::JobCreate, &job_id, &parties, |r| {
                r.with_body(payload.clone())
            })
            .await;
        if !result.is_success() {
            warn!(job_id = %job_id, detail = %result.detail(), "Job creation failed, rolling back");
            let created = result.succeeded();
            let cleaned = self
                .ctx
                .client
                .send_to_parties(Command::JobClean, &job_id, &created, |r| r)
                .await;
            if !cleaned.is_success() {
                error!(job_id = %job_id, detail = %cleaned.detail(), "Rollback of job creation failed");
            }
            self.ctx.db.delete_job(&job_id, None).await?;
            return Err(JobError::CreateFailed {
                id: job_id,
                detail: result.detail(),
            }
            .into());
        }

        info!(job_id = %job_id, parties = parties.len(), "Job submitted");
        Ok(job_id)
    }

    /// Move the job to `Running` at every party.
    pub async fn start_job(&self, job: &Job) -> Result<bool, Error> {
        let result = self
            .ctx
            .client
            .send_to_parties(Command::JobStart, &job.job_id, &job.parties(), |r| r)
            .await;
        if !result.is_success() {
            warn!(job_id = %job.job_id, detail = %result.detail(), "Job start failed");
            return Ok(false);
        }
        self.ctx
            .db
            .update_job_status(&job.job_id, None, Status::Running, TransitionMode::Normal)
            .await?;
        info!(job_id = %job.job_id, "Job started");
        Ok(true)
    }

    /// Stop the job everywhere with `status`. Unfinished tasks in the view
    /// take the same status.
    pub async fn stop_job(&self, job_id: &str, status: Status) -> Result<FederatedResult, Error> {
        let job = self.ctx.any_job(job_id).await?;
        let body = to_body(&StatusBody::new(status));
        let result = self
            .ctx
            .client
            .send_to_parties(Command::JobStop, job_id, &job.parties(), |r| {
                r.with_body(body.clone())
            })
            .await;
        if !result.is_success() {
            warn!(job_id, status = %status, detail = %result.detail(), "Job stop did not reach every party");
        }

        self.ctx
            .db
            .update_job_status(job_id, None, status, TransitionMode::Administrative)
            .await?;
        for task in self.ctx.latest_tasks(&TaskFilter::job(job_id)).await? {
            if !task.status.is_terminal() {
                self.ctx
                    .db
                    .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::Status, status)
                    .await?;
            }
            if !task.party_status.is_terminal() {
                self.ctx
                    .db
                    .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::PartyStatus, status)
                    .await?;
            }
        }
        info!(job_id, status = %status, "Job stopped");
        Ok(result)
    }

    /// Cooperative cancel: the scheduler stops the job at its next pass.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), Error> {
        let job = self.ctx.any_job(job_id).await?;
        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "Job already finished, nothing to cancel");
            return Ok(());
        }
        self.party.request_stop(job_id, Status::Canceled, None).await
    }

    /// Flag a finished job for rerun at the next scheduling pass.
    pub async fn rerun_job(&self, job_id: &str) -> Result<(), Error> {
        let job = self.ctx.any_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(JobError::NotRerunnable {
                id: job_id.to_string(),
                status: job.status,
            }
            .into());
        }
        self.ctx
            .db
            .update_job(
                job_id,
                None,
                &JobUpdate {
                    rerun_signal: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        info!(job_id, "Job rerun requested");
        Ok(())
    }

    /// Rerun every task whose latest version did not succeed, then put the
    /// job back to `Waiting` everywhere.
    pub async fn apply_rerun(&self, job: &Job) -> Result<(), Error> {
        let graph = self.ctx.graph(job)?;
        let view = self.summary_tasks(&job.job_id).await?;
        for name in graph.topological_order() {
            let Some(rows) = view.get(name) else {
                continue;
            };
            let Some(first) = rows.first() else {
                continue;
            };
            if !first.status.is_success() {
                self.tasks
                    .rerun_task(job, name, first.task_version + 1, RerunCause::Manual)
                    .await?;
            }
        }

        let result = self
            .ctx
            .client
            .send_to_parties(Command::JobRerun, &job.job_id, &job.parties(), |r| r)
            .await;
        if !result.is_success() {
            return Err(JobError::FederationFailed {
                id: job.job_id.clone(),
                command: Command::JobRerun.to_string(),
                detail: result.detail(),
            }
            .into());
        }
        self.ctx
            .db
            .update_job_status(&job.job_id, None, Status::Waiting, TransitionMode::Administrative)
            .await?;
        self.ctx
            .db
            .update_job(
                &job.job_id,
                None,
                &JobUpdate {
                    cancel_signal: Some(false),
                    stop_status: Some(None),
                    rerun_signal: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        info!(job_id = %job.job_id, "Job reset for rerun");
        Ok(())
    }

    /// Record the final status of a job and release its resources.
    pub async fn finish_job(&self, job: &Job, status: Status) -> Result<(), Error> {
        self.ctx
            .db
            .update_job_status(&job.job_id, None, status, TransitionMode::Normal)
            .await?;
        let body = to_body(&StatusBody::new(status));
        let synced = self
            .ctx
            .client
            .send_to_parties(Command::JobSyncStatus, &job.job_id, &job.parties(), |r| {
                r.with_body(body.clone())
            })
            .await;
        if !synced.is_success() {
            warn!(job_id = %job.job_id, detail = %synced.detail(), "Job status sync failed");
        }
        let returned = self.resources.return_for_job(job).await;
        if !returned.is_success() {
            warn!(job_id = %job.job_id, detail = %returned.detail(), "Job resource return failed");
        }
        info!(job_id = %job.job_id, status = %status, "Job finished");
        Ok(())
    }

    /// Remove a finished job from every party.
    pub async fn clean_job(&self, job_id: &str) -> Result<(), Error> {
        let job = self.ctx.any_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(JobError::NotTerminal {
                id: job_id.to_string(),
                status: job.status,
            }
            .into());
        }
        let result = self
            .ctx
            .client
            .send_to_parties(Command::JobClean, job_id, &job.parties(), |r| r)
            .await;
        if !result.is_success() {
            return Err(JobError::FederationFailed {
                id: job_id.to_string(),
                command: Command::JobClean.to_string(),
                detail: result.detail(),
            }
            .into());
        }
        self.ctx.db.delete_job(job_id, None).await?;
        info!(job_id, "Job cleaned");
        Ok(())
    }

    pub async fn describe_job(&self, job_id: &str) -> Result<JobSummary, Error> {
        let job = self.ctx.any_job(job_id).await?;
        let tasks = self.summary_tasks(job_id).await?;
        Ok(JobSummary { job, tasks })
    }

    async fn summary_tasks(&self, job_id: &str) -> Result<BTreeMap<String, Vec<Task>>, Error> {
        let mut grouped: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for task in self.ctx.latest_tasks(&TaskFilter::job(job_id)).await? {
            grouped.entry(task.task_name.clone()).or_default().push(task);
        }
        Ok(grouped)
    }
}

/// Time-ordered job id: `yyyymmddHHMMSSmmm` plus six random digits.
fn new_job_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}{suffix:06}", Utc::now().format("%Y%m%d%H%M%S%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_sort_by_time() {
        let a = new_job_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_job_id();
        assert_eq!(a.len(), 23);
        assert!(a.chars().all(|c| c.is_ascii_digit()));
        assert!(a < b);
    }
}
