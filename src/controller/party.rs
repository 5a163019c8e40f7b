//! Local effects of federated commands at one party.
//!
//! Every method acts on the records of one `(role, party_id)` held by this
//! party and is safe to repeat: creates ignore duplicates and status writes
//! are conditional, so a retried command leaves the same state behind.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::PartyContext;
use crate::dag::{PartyRef, ResolvedInput, SyncType, TaskGraph};
use crate::engine::{EngineStatus, LaunchSpec};
use crate::error::{Error, JobError};
use crate::federation::{Command, CreateJobBody, FedRequest, StatusBody, TaskStatusReport};
use crate::federation::protocol::to_body;
use crate::resource::ResourceLedger;
use crate::status::{Status, TransitionMode};
use crate::store::{
    Job, JobKey, JobUpdate, RerunCause, StatusField, Task, TaskFilter, TaskKey, TaskUpdate, task_id_for,
};

pub struct PartyController {
    ctx: Arc<PartyContext>,
    ledger: Arc<ResourceLedger>,
}

impl PartyController {
    pub fn new(ctx: Arc<PartyContext>, ledger: Arc<ResourceLedger>) -> Self {
        Self { ctx, ledger }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Create the job record of `party` and version 0 of every task it runs.
    pub async fn create_job(&self, party: &PartyRef, job_id: &str, body: CreateJobBody) -> Result<(), Error> {
        let graph = TaskGraph::build(body.dag.clone())?;
        let job = Job::new(
            job_id,
            party,
            body.dag,
            body.initiator_party_id,
            body.scheduler_party_id,
        );
        if !self.ctx.db.create_job(&job).await? {
            debug!(job_id, party = %party, "Job record already exists");
        }
        for name in graph.tasks_for_party(party) {
            let task = Task::from_graph(&job, &graph, name, party, 0);
            self.ctx.db.create_task(&task).await?;
        }
        info!(job_id, party = %party, "Job created");
        Ok(())
    }

    pub async fn start_job(&self, party: &PartyRef, job_id: &str) -> Result<(), Error> {
        self.ctx.job(job_id, party).await?;
        self.ctx
            .db
            .update_job_status(job_id, Some(party), Status::Running, TransitionMode::Normal)
            .await?;
        Ok(())
    }

    /// Stop every unfinished task of the job here, then set the job status
    /// and give the job's resources back.
    pub async fn stop_job(&self, party: &PartyRef, job_id: &str, status: Status) -> Result<(), Error> {
        let job = self.ctx.job(job_id, party).await?;
        for task in self.local_tasks(job_id, party).await? {
            if !task.party_status.is_terminal() {
                self.stop_task(&task.key(), status).await?;
            }
        }
        self.ctx
            .db
            .update_job_status(job_id, Some(party), status, TransitionMode::Administrative)
            .await?;
        self.ledger.return_job(&job.key()).await?;
        info!(job_id, party = %party, status = %status, "Job stopped");
        Ok(())
    }

    pub async fn sync_job_status(&self, party: &PartyRef, job_id: &str, status: Status) -> Result<(), Error> {
        self.ctx.job(job_id, party).await?;
        let updated = self
            .ctx
            .db
            .update_job_status(job_id, Some(party), status, TransitionMode::Normal)
            .await?;
        debug!(job_id, party = %party, status = %status, updated, "Job status synced");
        Ok(())
    }

    /// Put a terminal job back to `Waiting` so the scheduler picks it up.
    pub async fn rerun_job(&self, party: &PartyRef, job_id: &str) -> Result<(), Error> {
        self.ctx.job(job_id, party).await?;
        self.ctx
            .db
            .update_job_status(job_id, Some(party), Status::Waiting, TransitionMode::Administrative)
            .await?;
        self.ctx
            .db
            .update_job(
                job_id,
                Some(party),
                &JobUpdate {
                    cancel_signal: Some(false),
                    stop_status: Some(None),
                    rerun_signal: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Kill leftover workers, return resources and delete the records.
    pub async fn clean_job(&self, party: &PartyRef, job_id: &str) -> Result<(), Error> {
        let Some(job) = self.ctx.db.get_job(&JobKey::new(job_id, party)).await? else {
            // Already cleaned.
            return Ok(());
        };
        for task in self.ctx.db.query_tasks(&party_filter(job_id, party)).await? {
            if task.worker_handle.is_some() && !task.kill_status {
                self.kill_worker(&task).await;
            }
            self.ledger.return_task(&task.key()).await?;
        }
        self.ledger.return_job(&job.key()).await?;
        let deleted = self.ctx.db.delete_job(job_id, Some(party)).await?;
        info!(job_id, party = %party, deleted, "Job cleaned");
        Ok(())
    }

    /// Ask the scheduling party to stop the job at its next pass.
    pub async fn request_stop(&self, job_id: &str, status: Status, reason: Option<String>) -> Result<(), Error> {
        let job = self.ctx.any_job(job_id).await?;
        if job.scheduler_party_id == self.ctx.party_id() {
            return self.mark_stop_requested(job_id, status, reason).await;
        }

        let scheduler = job
            .parties()
            .into_iter()
            .find(|p| p.party_id == job.scheduler_party_id)
            .unwrap_or_else(|| PartyRef::new("", job.scheduler_party_id.clone()));
        let body = StatusBody { status, reason };
        let reply = self
            .ctx
            .client
            .send_to_scheduler(
                &job.scheduler_party_id,
                Command::JobRequestStop,
                FedRequest::new(job_id, &scheduler).with_body(to_body(&body)),
            )
            .await;
        if !reply.is_success() {
            return Err(JobError::FederationFailed {
                id: job_id.to_string(),
                command: Command::JobRequestStop.to_string(),
                detail: reply.describe(),
            }
            .into());
        }
        Ok(())
    }

    /// Record a stop request on every record of the job held here.
    pub async fn mark_stop_requested(
        &self,
        job_id: &str,
        status: Status,
        reason: Option<String>,
    ) -> Result<(), Error> {
        let updated = self
            .ctx
            .db
            .update_job(
                job_id,
                None,
                &JobUpdate {
                    cancel_signal: Some(true),
                    stop_status: Some(Some(status)),
                    error_report: reason,
                    ..Default::default()
                },
            )
            .await?;
        if !updated {
            return Err(JobError::NotFound {
                id: job_id.to_string(),
            }
            .into());
        }
        info!(job_id, status = %status, "Stop requested");
        Ok(())
    }

    pub async fn apply_job_resource(&self, party: &PartyRef, job_id: &str) -> Result<bool, Error> {
        self.ledger.apply_job(&JobKey::new(job_id, party)).await
    }

    pub async fn return_job_resource(&self, party: &PartyRef, job_id: &str) -> Result<bool, Error> {
        self.ledger.return_job(&JobKey::new(job_id, party)).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Create `task_version` of a task here. Repeating the current version is
    /// a no-op; asking for an older one is an error.
    pub async fn create_task(
        &self,
        party: &PartyRef,
        job_id: &str,
        task_name: &str,
        task_version: u32,
        cause: RerunCause,
    ) -> Result<(), Error> {
        let task_id = task_id_for(job_id, task_name);
        let filter = TaskFilter {
            task_id: Some(task_id.clone()),
            ..party_filter(job_id, party)
        };
        let latest = self.ctx.latest_tasks(&filter).await?.into_iter().next();

        let task = match latest {
            Some(current) if current.task_version > task_version => {
                return Err(JobError::StaleVersion {
                    task_id,
                    current: current.task_version,
                    requested: task_version,
                }
                .into());
            }
            Some(current) if current.task_version == task_version => return Ok(()),
            Some(current) => current.next_version(task_version, cause),
            None => {
                let job = self.ctx.job(job_id, party).await?;
                let graph = self.ctx.graph(&job)?;
                if !graph.contains(task_name) {
                    return Err(JobError::TaskNotFound {
                        task_id,
                        version: task_version,
                    }
                    .into());
                }
                Task::from_graph(&job, &graph, task_name, party, task_version)
            }
        };
        self.ctx.db.create_task(&task).await?;
        info!(task = %task.key(), "Task version created");
        Ok(())
    }

    /// Launch the worker of a task version here.
    pub async fn start_task(&self, key: &TaskKey) -> Result<(), Error> {
        let mut task = self.task(key).await?;
        if task.party_status != Status::Waiting && task.party_status != Status::Ready {
            debug!(task = %key, status = %task.party_status, "Task already started");
            return Ok(());
        }

        let job = self.ctx.job(&task.job_id, &task.party()).await?;
        let graph = self.ctx.graph(&job)?;
        let outputs = graph
            .task_spec(&task.task_name)
            .map(|s| s.outputs.clone())
            .unwrap_or_default();
        self.resolve_inputs(&mut task).await?;

        let engine = self.ctx.engines.get(&task.engine).await?;
        let db = &self.ctx.db;
        if !db
            .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::PartyStatus, Status::Running)
            .await?
        {
            return Ok(());
        }

        match engine.run(&LaunchSpec::for_task(&task, outputs)).await {
            Ok(handle) => {
                db.update_task(
                    key,
                    &TaskUpdate {
                        worker_handle: Some(handle.clone()),
                        worker_instance: Some(self.ctx.instance_id().to_string()),
                        inputs: Some(task.inputs.clone()),
                        ..Default::default()
                    },
                )
                .await?;
                info!(task = %key, engine = %task.engine, handle = %handle, "Task started");
                Ok(())
            }
            Err(e) => {
                warn!(task = %key, error = %e, "Task launch failed");
                db.update_task(
                    key,
                    &TaskUpdate {
                        error_report: Some(e.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
                db.update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::PartyStatus, Status::Failed)
                    .await?;
                self.ledger.return_task(key).await?;
                Err(e.into())
            }
        }
    }

    /// Kill the worker of a task version and settle its party status.
    pub async fn stop_task(&self, key: &TaskKey, status: Status) -> Result<(), Error> {
        let task = self.task(key).await?;
        if task.worker_handle.is_some() && !task.kill_status {
            self.kill_worker(&task).await;
        }
        self.ctx
            .db
            .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::PartyStatus, status)
            .await?;
        self.ledger.return_task(key).await?;
        debug!(task = %key, status = %status, "Task stopped");
        Ok(())
    }

    /// Refresh a task from its engine and report its party status.
    pub async fn collect(&self, key: &TaskKey) -> Result<TaskStatusReport, Error> {
        let task = self.refresh_task(&self.task(key).await?).await?;
        Ok(TaskStatusReport {
            party_status: task.party_status,
            outputs: task.outputs,
            error_report: task.error_report,
        })
    }

    pub async fn sync_task_status(&self, key: &TaskKey, status: Status) -> Result<(), Error> {
        let task = self.task(key).await?;
        self.ctx
            .db
            .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::Status, status)
            .await?;
        Ok(())
    }

    /// Scheduler side of a callback: record another party's status.
    pub async fn report_status(&self, key: &TaskKey, report: TaskStatusReport) -> Result<(), Error> {
        let task = self.task(key).await?;
        if !report.outputs.is_empty() || report.error_report.is_some() {
            self.ctx
                .db
                .update_task(
                    key,
                    &TaskUpdate {
                        outputs: (!report.outputs.is_empty()).then_some(report.outputs),
                        error_report: report.error_report,
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.ctx
            .db
            .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::PartyStatus, report.party_status)
            .await?;
        Ok(())
    }

    pub async fn apply_task_resource(&self, key: &TaskKey) -> Result<bool, Error> {
        self.ledger.apply_task(key).await
    }

    pub async fn return_task_resource(&self, key: &TaskKey) -> Result<bool, Error> {
        self.ledger.return_task(key).await
    }

    /// Ask the engine about a running task and record a finished worker.
    /// Returns the task as stored afterwards.
    pub async fn refresh_task(&self, task: &Task) -> Result<Task, Error> {
        let Some(handle) = task.worker_handle.as_deref() else {
            return Ok(task.clone());
        };
        if task.party_status != Status::Running {
            return Ok(task.clone());
        }

        let engine = self.ctx.engines.get(&task.engine).await?;
        let (status, update) = match engine.query_status(handle).await? {
            EngineStatus::Running => return Ok(task.clone()),
            EngineStatus::Success { outputs } => (
                Status::Success,
                TaskUpdate {
                    outputs: Some(outputs),
                    ..Default::default()
                },
            ),
            EngineStatus::Failed { reason } => (
                Status::Failed,
                TaskUpdate {
                    error_report: Some(reason),
                    ..Default::default()
                },
            ),
            // The engine lost track of the worker, e.g. after a restart. The
            // detector decides once the loss is confirmed.
            EngineStatus::Unknown => {
                debug!(task = %task.key(), handle, "Engine does not know the worker");
                return Ok(task.clone());
            }
        };

        let key = task.key();
        self.ctx.db.update_task(&key, &update).await?;
        let changed = self
            .ctx
            .db
            .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::PartyStatus, status)
            .await?;
        self.ledger.return_task(&key).await?;
        let refreshed = self.task(&key).await?;
        if changed {
            info!(task = %key, status = %status, "Task finished at party");
            self.report_if_callback(&refreshed).await;
        }
        Ok(refreshed)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn task(&self, key: &TaskKey) -> Result<Task, Error> {
        self.ctx.db.get_task(key).await?.ok_or_else(|| {
            JobError::TaskNotFound {
                task_id: key.task_id.clone(),
                version: key.task_version,
            }
            .into()
        })
    }

    async fn local_tasks(&self, job_id: &str, party: &PartyRef) -> Result<Vec<Task>, Error> {
        self.ctx.latest_tasks(&party_filter(job_id, party)).await
    }

    /// Point task-output inputs at the producer's latest outputs at the same
    /// party.
    async fn resolve_inputs(&self, task: &mut Task) -> Result<(), Error> {
        let party = task.party();
        for (key, input) in task.inputs.iter_mut() {
            let ResolvedInput::TaskOutput {
                task: producer,
                output,
                location,
            } = input
            else {
                continue;
            };
            let filter = TaskFilter {
                task_id: Some(task_id_for(&task.job_id, producer)),
                ..party_filter(&task.job_id, &party)
            };
            let found = self
                .ctx
                .latest_tasks(&filter)
                .await?
                .into_iter()
                .find_map(|t| t.outputs.get(output.as_str()).cloned());
            if found.is_none() {
                debug!(task_id = %task.task_id, input = %key, producer = %producer, "Producer output not held by this party");
            }
            *location = found;
        }
        Ok(())
    }

    async fn kill_worker(&self, task: &Task) {
        let Some(handle) = task.worker_handle.as_deref() else {
            return;
        };
        let killed = match self.ctx.engines.get(&task.engine).await {
            Ok(engine) => engine.kill(handle).await.map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        match killed {
            Ok(()) => {
                let update = TaskUpdate {
                    kill_status: Some(true),
                    ..Default::default()
                };
                if let Err(e) = self.ctx.db.update_task(&task.key(), &update).await {
                    warn!(task = %task.key(), error = %e, "Failed to record killed worker");
                }
            }
            Err(e) => warn!(task = %task.key(), handle, error = %e, "Failed to kill worker"),
        }
    }

    async fn report_if_callback(&self, task: &Task) {
        let job = match self.ctx.job(&task.job_id, &task.party()).await {
            Ok(job) => job,
            Err(e) => {
                warn!(task = %task.key(), error = %e, "No job record for status report");
                return;
            }
        };
        if job.dag.conf.sync_type != SyncType::Callback || job.scheduler_party_id == self.ctx.party_id() {
            return;
        }
        let report = TaskStatusReport {
            party_status: task.party_status,
            outputs: task.outputs.clone(),
            error_report: task.error_report.clone(),
        };
        let request = FedRequest::new(&task.job_id, &task.party())
            .with_task(task.task_id.clone(), task.task_version)
            .with_body(to_body(&report));
        let reply = self
            .ctx
            .client
            .send_to_scheduler(&job.scheduler_party_id, Command::TaskReportStatus, request)
            .await;
        if !reply.is_success() {
            warn!(task = %task.key(), reply = %reply.describe(), "Status report to scheduler failed");
        }
    }
}

fn party_filter(job_id: &str, party: &PartyRef) -> TaskFilter {
    TaskFilter {
        party: Some(party.clone()),
        ..TaskFilter::job(job_id)
    }
}
