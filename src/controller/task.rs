//! Federated task operations issued by the scheduling party.

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::PartyContext;
use crate::controller::PartyController;
use crate::dag::PartyRef;
use crate::error::{Error, JobError};
use crate::federation::protocol::to_body;
use crate::federation::{
    Command, CreateTaskBody, FedRequest, FederatedResult, PartyReply, StatusBody, TaskStatusReport,
};
use crate::status::Status;
use crate::store::{Job, RerunCause, StatusField, Task, TaskFilter, TaskKey, task_id_for};

pub struct TaskController {
    ctx: Arc<PartyContext>,
    party: Arc<PartyController>,
}

impl TaskController {
    pub fn new(ctx: Arc<PartyContext>, party: Arc<PartyController>) -> Self {
        Self { ctx, party }
    }

    /// Latest-version rows of one task across all parties, from the
    /// schedule view.
    pub async fn view_rows(&self, job_id: &str, task_name: &str) -> Result<Vec<Task>, Error> {
        self.ctx
            .latest_tasks(&TaskFilter {
                task_id: Some(task_id_for(job_id, task_name)),
                ..TaskFilter::job(job_id)
            })
            .await
    }

    /// Create `new_version` of a task at every party running it. The version
    /// must exceed the current one.
    pub async fn rerun_task(
        &self,
        job: &Job,
        task_name: &str,
        new_version: u32,
        cause: RerunCause,
    ) -> Result<(), Error> {
        let rows = self.view_rows(&job.job_id, task_name).await?;
        let task_id = task_id_for(&job.job_id, task_name);
        let current = rows.iter().map(|t| t.task_version).max().ok_or_else(|| {
            JobError::TaskNotFound {
                task_id: task_id.clone(),
                version: new_version,
            }
        })?;
        if new_version <= current {
            return Err(JobError::StaleVersion {
                task_id,
                current,
                requested: new_version,
            }
            .into());
        }

        for row in &rows {
            self.ctx.db.create_task(&row.next_version(new_version, cause)).await?;
        }
        let parties: Vec<PartyRef> = rows.iter().map(Task::party).collect();
        let body = to_body(&CreateTaskBody {
            task_name: task_name.to_string(),
            cause,
        });
        let result = self
            .ctx
            .client
            .send_to_parties(Command::TaskCreate, &job.job_id, &parties, |r| {
                r.with_task(task_id.clone(), new_version).with_body(body.clone())
            })
            .await;
        if !result.is_success() {
            return Err(JobError::FederationFailed {
                id: job.job_id.clone(),
                command: Command::TaskCreate.to_string(),
                detail: result.detail(),
            }
            .into());
        }
        info!(job_id = %job.job_id, task_id = %task_id, version = new_version, "Task rerun created");
        Ok(())
    }

    pub async fn start_task(&self, task: &Task, parties: &[PartyRef]) -> FederatedResult {
        self.send(Command::TaskStart, task, parties, serde_json::Value::Null)
            .await
    }

    pub async fn stop_task(&self, task: &Task, parties: &[PartyRef], status: Status) -> FederatedResult {
        self.send(Command::TaskStop, task, parties, to_body(&StatusBody::new(status)))
            .await
    }

    /// Set the aggregate status in the view, then push it to every party.
    pub async fn sync_status(&self, task: &Task, parties: &[PartyRef], status: Status) -> Result<FederatedResult, Error> {
        self.ctx
            .db
            .update_task_status(&task.task_id, task.task_version, None, StatusField::Status, status)
            .await?;
        Ok(self
            .send(Command::TaskSyncStatus, task, parties, to_body(&StatusBody::new(status)))
            .await)
    }

    /// Pull every party's status of a task version into the view.
    pub async fn collect(&self, task: &Task, parties: &[PartyRef]) -> Result<(), Error> {
        let result = self
            .send(Command::TaskCollect, task, parties, serde_json::Value::Null)
            .await;
        for (party, reply) in &result.replies {
            let PartyReply::Answered(response) = reply else {
                continue;
            };
            if !response.is_success() {
                continue;
            }
            match serde_json::from_value::<TaskStatusReport>(response.data.clone()) {
                Ok(report) => {
                    let key = TaskKey {
                        task_id: task.task_id.clone(),
                        task_version: task.task_version,
                        role: party.role.clone(),
                        party_id: party.party_id.clone(),
                    };
                    self.party.report_status(&key, report).await?;
                }
                Err(e) => warn!(task_id = %task.task_id, party = %party, error = %e, "Undecodable collect reply"),
            }
        }
        Ok(())
    }

    async fn send(
        &self,
        command: Command,
        task: &Task,
        parties: &[PartyRef],
        body: serde_json::Value,
    ) -> FederatedResult {
        let prepare = |r: FedRequest| {
            r.with_task(task.task_id.clone(), task.task_version)
                .with_body(body.clone())
        };
        self.ctx
            .client
            .send_to_parties(command, &task.job_id, parties, prepare)
            .await
    }
}
