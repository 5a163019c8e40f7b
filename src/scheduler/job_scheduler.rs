//! Periodic job loop of the scheduling party.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::context::PartyContext;
use crate::controller::JobController;
use crate::error::Error;
use crate::resource::ResourceManager;
use crate::scheduler::lock::with_schedule_lock;
use crate::scheduler::task_scheduler::{SchedulingOutcome, TaskScheduler};
use crate::status::{Status, merge};
use crate::store::{Job, JobFilter, TaskFilter};

pub struct JobScheduler {
    ctx: Arc<PartyContext>,
    jobs: Arc<JobController>,
    tasks: Arc<TaskScheduler>,
    resources: Arc<ResourceManager>,
}

impl JobScheduler {
    pub fn new(
        ctx: Arc<PartyContext>,
        jobs: Arc<JobController>,
        tasks: Arc<TaskScheduler>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        Self {
            ctx,
            jobs,
            tasks,
            resources,
        }
    }

    /// One tick: run a pass for every active job this party schedules, up to
    /// `max_concurrent_jobs` at a time. Jobs locked by another pass are skipped.
    pub async fn tick(&self) -> Result<(), Error> {
        let job_ids = self.active_job_ids().await?;
        if job_ids.is_empty() {
            return Ok(());
        }
        debug!(jobs = job_ids.len(), "Scheduling tick");

        let limit = self.ctx.config.max_concurrent_jobs.max(1);
        futures::stream::iter(job_ids)
            .for_each_concurrent(limit, |job_id| async move {
                let pass = with_schedule_lock(
                    self.ctx.db.as_ref(),
                    &job_id,
                    self.ctx.config.lock_lease,
                    self.schedule_job(&job_id),
                )
                .await;
                if let Err(e) = pass {
                    error!(job_id = %job_id, error = %e, "Scheduling pass failed");
                }
            })
            .await;
        Ok(())
    }

    async fn active_job_ids(&self) -> Result<Vec<String>, Error> {
        let me = self.ctx.party_id().to_string();
        let mut jobs = self
            .ctx
            .db
            .query_jobs(&JobFilter {
                scheduler_party_id: Some(me.clone()),
                statuses: vec![Status::Waiting, Status::Running],
                ..Default::default()
            })
            .await?;
        jobs.extend(
            self.ctx
                .db
                .query_jobs(&JobFilter {
                    scheduler_party_id: Some(me),
                    rerun_signal: Some(true),
                    ..Default::default()
                })
                .await?,
        );

        let mut ids: Vec<String> = Vec::new();
        for job in jobs {
            if !ids.contains(&job.job_id) {
                ids.push(job.job_id);
            }
        }
        Ok(ids)
    }

    /// One pass over one job; the caller holds its schedule lock.
    async fn schedule_job(&self, job_id: &str) -> Result<(), Error> {
        // Re-read under the lock.
        let job = self.ctx.any_job(job_id).await?;

        if job.rerun_signal {
            return self.jobs.apply_rerun(&job).await;
        }
        match job.status {
            Status::Waiting => self.schedule_waiting(&job).await,
            Status::Running => self.schedule_running(&job).await,
            _ => Ok(()),
        }
    }

    async fn schedule_waiting(&self, job: &Job) -> Result<(), Error> {
        if job.cancel_signal {
            return self.stop(job, stop_status(job)).await;
        }
        if !self.resources.apply_for_job(job).await? {
            debug!(job_id = %job.job_id, "Job waiting for resources");
            return Ok(());
        }
        if !self.jobs.start_job(job).await? {
            warn!(job_id = %job.job_id, "Job start failed at some party, failing job");
            return self.stop(job, Status::Failed).await;
        }
        Ok(())
    }

    async fn schedule_running(&self, job: &Job) -> Result<(), Error> {
        if job.cancel_signal {
            return self.stop(job, stop_status(job)).await;
        }

        let outcome = self.tasks.schedule(job).await?;
        let status = self.job_status(job).await?;
        if outcome == SchedulingOutcome::Failed || status.is_interrupt() {
            let status = if status.is_interrupt() {
                status
            } else {
                Status::Failed
            };
            return self.stop(job, status).await;
        }
        if status.is_terminal() {
            self.jobs.finish_job(job, status).await?;
        }
        Ok(())
    }

    /// Stop the job everywhere and release its resources.
    async fn stop(&self, job: &Job, status: Status) -> Result<(), Error> {
        info!(job_id = %job.job_id, status = %status, "Stopping job");
        self.jobs.stop_job(&job.job_id, status).await?;
        self.jobs.finish_job(job, status).await
    }

    /// Merge of the aggregate statuses of the job's tasks.
    async fn job_status(&self, job: &Job) -> Result<Status, Error> {
        let statuses: Vec<Status> = self
            .ctx
            .latest_tasks(&TaskFilter::job(&job.job_id))
            .await?
            .into_iter()
            .map(|t| t.status)
            .collect();
        Ok(merge(&statuses)?)
    }
}

/// Run [`JobScheduler::tick`] every `interval` until the process exits.
pub fn spawn_schedule_ticker(scheduler: Arc<JobScheduler>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.tick().await {
                error!(error = %e, "Schedule tick failed");
            }
        }
    })
}

fn stop_status(job: &Job) -> Status {
    job.stop_status.unwrap_or(Status::Canceled)
}
