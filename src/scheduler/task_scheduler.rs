//! One scheduling pass over the tasks of a running job.
//!
//! A pass runs `collect → merge → detect interrupts → compute ready →
//! dispatch` against the schedule view, the scheduling party's copy of every
//! party's task records.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::PartyContext;
use crate::controller::TaskController;
use crate::dag::{PartyRef, SyncType, TaskGraph};
use crate::error::Error;
use crate::resource::ResourceManager;
use crate::status::{Status, merge};
use crate::store::{Job, RerunCause, StatusField, Task, TaskFilter, TaskUpdate};

/// Result of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingOutcome {
    /// At least one task was dispatched.
    HaveNext,
    /// Nothing could be dispatched this pass.
    NoNext,
    /// A task was interrupted with no retry left, or failed to start.
    Failed,
}

/// Latest-version records of one task, one per party.
struct TaskGroup {
    rows: Vec<Task>,
}

impl TaskGroup {
    fn head(&self) -> &Task {
        &self.rows[0]
    }

    /// Aggregate status; every record of a version shares it.
    fn status(&self) -> Status {
        self.head().status
    }

    fn parties(&self) -> Vec<PartyRef> {
        self.rows.iter().map(Task::party).collect()
    }

    fn party_statuses(&self) -> Vec<Status> {
        self.rows.iter().map(|t| t.party_status).collect()
    }
}

pub struct TaskScheduler {
    ctx: Arc<PartyContext>,
    tasks: Arc<TaskController>,
    resources: Arc<ResourceManager>,
}

impl TaskScheduler {
    pub fn new(ctx: Arc<PartyContext>, tasks: Arc<TaskController>, resources: Arc<ResourceManager>) -> Self {
        Self {
            ctx,
            tasks,
            resources,
        }
    }

    pub async fn schedule(&self, job: &Job) -> Result<SchedulingOutcome, Error> {
        let graph = self.ctx.graph(job)?;

        if job.dag.conf.sync_type == SyncType::Poll {
            self.collect(&graph, job).await?;
        }
        self.merge(&graph, job).await?;

        let groups = self.view(&graph, job).await?;
        let mut retried = false;
        for name in graph.topological_order() {
            let Some(group) = groups.get(name) else {
                continue;
            };
            let status = group.status();
            if !status.is_interrupt() {
                continue;
            }
            let head = group.head();
            let retryable = matches!(status, Status::Failed | Status::Timeout)
                && head.auto_retries > 0
                && !job.cancel_signal;
            if !retryable {
                info!(job_id = %job.job_id, task = %name, status = %status, "Task interrupted, failing job");
                return Ok(SchedulingOutcome::Failed);
            }

            // Settle leftovers of the interrupted version before replacing it.
            let lingering: Vec<PartyRef> = group
                .rows
                .iter()
                .filter(|t| !t.party_status.is_terminal())
                .map(Task::party)
                .collect();
            if !lingering.is_empty() {
                self.tasks.stop_task(head, &lingering, status).await;
            }
            info!(
                job_id = %job.job_id,
                task = %name,
                version = head.task_version + 1,
                retries_left = head.auto_retries - 1,
                "Retrying interrupted task"
            );
            self.tasks
                .rerun_task(job, name, head.task_version + 1, RerunCause::AutoRetry)
                .await?;
            retried = true;
        }
        if retried {
            return Ok(SchedulingOutcome::NoNext);
        }

        let ready = ready_tasks(&graph, &groups);
        if job.cancel_signal {
            debug!(job_id = %job.job_id, "Cancel requested, not dispatching");
            return Ok(SchedulingOutcome::NoNext);
        }
        self.dispatch(job, &groups, &ready).await
    }

    /// Pull party statuses of every running task.
    async fn collect(&self, graph: &TaskGraph, job: &Job) -> Result<(), Error> {
        let groups = self.view(graph, job).await?;
        for group in groups.values() {
            if group.status() == Status::Running {
                self.tasks.collect(group.head(), &group.parties()).await?;
            }
        }
        Ok(())
    }

    /// Fold party statuses of every running task into its aggregate status.
    async fn merge(&self, graph: &TaskGraph, job: &Job) -> Result<(), Error> {
        let groups = self.view(graph, job).await?;
        for (name, group) in &groups {
            if group.status() != Status::Running {
                continue;
            }
            let merged = merge(&group.party_statuses())?;
            if !merged.is_terminal() {
                continue;
            }
            debug!(job_id = %job.job_id, task = %name, status = %merged, "Task status merged");
            let synced = self
                .tasks
                .sync_status(group.head(), &group.parties(), merged)
                .await?;
            if !synced.is_success() {
                warn!(job_id = %job.job_id, task = %name, detail = %synced.detail(), "Task status sync incomplete");
            }
        }
        Ok(())
    }

    /// Start ready tasks in order until a resource denial.
    async fn dispatch(
        &self,
        job: &Job,
        groups: &HashMap<String, TaskGroup>,
        ready: &[String],
    ) -> Result<SchedulingOutcome, Error> {
        let mut dispatched = false;
        for name in ready {
            let Some(group) = groups.get(name) else {
                continue;
            };
            let head = group.head();
            let parties = group.parties();

            if !self.resources.apply_for_task(head, &parties).await? {
                debug!(job_id = %job.job_id, task = %name, "No resources for task, retrying next pass");
                break;
            }

            let synced = self
                .tasks
                .sync_status(head, &parties, Status::Running)
                .await?;
            if !synced.is_success() {
                warn!(job_id = %job.job_id, task = %name, detail = %synced.detail(), "Task running sync incomplete");
            }
            let started = self.tasks.start_task(head, &parties).await;
            if started.is_success() {
                info!(job_id = %job.job_id, task = %name, version = head.task_version, "Task dispatched");
                dispatched = true;
                continue;
            }

            warn!(job_id = %job.job_id, task = %name, detail = %started.detail(), "Task start failed");
            self.ctx
                .db
                .update_task(
                    &head.key(),
                    &TaskUpdate {
                        error_report: Some(started.detail()),
                        ..Default::default()
                    },
                )
                .await?;
            for task in &group.rows {
                self.ctx
                    .db
                    .update_task_status(&task.task_id, task.task_version, Some(&task.party()), StatusField::PartyStatus, Status::Failed)
                    .await?;
            }
            self.tasks
                .sync_status(head, &parties, Status::Failed)
                .await?;
            self.tasks.stop_task(head, &parties, Status::Failed).await;
            self.resources.return_for_task(head, &parties).await;
            return Ok(SchedulingOutcome::Failed);
        }
        Ok(if dispatched {
            SchedulingOutcome::HaveNext
        } else {
            SchedulingOutcome::NoNext
        })
    }

    async fn view(&self, graph: &TaskGraph, job: &Job) -> Result<HashMap<String, TaskGroup>, Error> {
        let mut groups: HashMap<String, TaskGroup> = HashMap::new();
        for task in self.ctx.latest_tasks(&TaskFilter::job(&job.job_id)).await? {
            if !graph.contains(&task.task_name) {
                continue;
            }
            groups
                .entry(task.task_name.clone())
                .or_insert_with(|| TaskGroup { rows: Vec::new() })
                .rows
                .push(task);
        }
        Ok(groups)
    }
}

/// Tasks whose every upstream task succeeded, in topological order. A task
/// stays `Waiting` until it is actually dispatched, so a denied task is found
/// ready again next pass.
fn ready_tasks(graph: &TaskGraph, groups: &HashMap<String, TaskGroup>) -> Vec<String> {
    graph
        .topological_order()
        .iter()
        .filter(|name| {
            groups
                .get(name.as_str())
                .is_some_and(|g| matches!(g.status(), Status::Waiting | Status::Ready))
        })
        .filter(|name| {
            graph.dependent_tasks_of(name).iter().all(|upstream| {
                groups
                    .get(upstream.as_str())
                    .is_some_and(|g| g.status().is_success())
            })
        })
        .cloned()
        .collect()
}
