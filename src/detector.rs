//! Detector: periodic liveness and timeout audit of this party.
//!
//! Each tick refreshes the workers this instance launched, asks the
//! scheduling party to stop jobs whose workers vanished or ran past their
//! budget, kills workers of ended tasks, reclaims resources still held by
//! finished jobs, clears expired schedule locks and times out jobs that
//! waited too long for resources.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::PartyContext;
use crate::controller::PartyController;
use crate::error::Error;
use crate::status::Status;
use crate::store::{JobFilter, Task, TaskFilter, TaskKey};

/// Consecutive failed liveness probes before a worker counts as gone.
const LIVENESS_CONFIRMATIONS: u32 = 2;

const TERMINAL: [Status; 6] = [
    Status::Success,
    Status::Pass,
    Status::Failed,
    Status::Canceled,
    Status::Timeout,
    Status::Rejected,
];

pub struct Detector {
    ctx: Arc<PartyContext>,
    party: Arc<PartyController>,
    /// Failed probes per task, reset when a probe succeeds.
    suspects: Mutex<HashMap<TaskKey, u32>>,
}

impl Detector {
    pub fn new(ctx: Arc<PartyContext>, party: Arc<PartyController>) -> Self {
        Self {
            ctx,
            party,
            suspects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn tick(&self) -> Result<(), Error> {
        self.check_running_tasks().await?;
        self.kill_ended_workers().await?;
        self.reclaim_resources().await?;
        self.clear_expired_locks().await?;
        self.check_waiting_jobs().await?;
        Ok(())
    }

    async fn check_running_tasks(&self) -> Result<(), Error> {
        let running = self
            .ctx
            .db
            .query_tasks(&TaskFilter {
                party_id: Some(self.ctx.party_id().to_string()),
                party_statuses: vec![Status::Running],
                worker_instance: Some(self.ctx.instance_id().to_string()),
                ..Default::default()
            })
            .await?;

        let mut stopped: HashSet<String> = HashSet::new();
        for task in running {
            let key = task.key();
            let task = match self.party.refresh_task(&task).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(task = %key, error = %e, "Failed to refresh task");
                    continue;
                }
            };
            if task.party_status != Status::Running {
                self.suspects.lock().await.remove(&key);
                continue;
            }
            if stopped.contains(&task.job_id) {
                continue;
            }

            if let Some(reason) = timed_out(&task) {
                self.request_stop(&task.job_id, Status::Timeout, reason).await;
                stopped.insert(task.job_id.clone());
                continue;
            }
            if self.confirm_dead(&task).await {
                let reason = format!("worker of task {key} is gone");
                self.request_stop(&task.job_id, Status::Failed, reason).await;
                stopped.insert(task.job_id.clone());
            }
        }
        Ok(())
    }

    /// Probe a worker; true once it failed enough consecutive probes.
    async fn confirm_dead(&self, task: &Task) -> bool {
        let key = task.key();
        let Some(handle) = task.worker_handle.as_deref() else {
            return false;
        };
        let alive = match self.ctx.engines.get(&task.engine).await {
            Ok(engine) => engine.is_alive(handle).await,
            Err(e) => Err(e),
        };
        let mut suspects = self.suspects.lock().await;
        match alive {
            Ok(true) => {
                suspects.remove(&key);
                false
            }
            Ok(false) => {
                let misses = suspects.entry(key.clone()).or_insert(0);
                *misses += 1;
                if *misses >= LIVENESS_CONFIRMATIONS {
                    suspects.remove(&key);
                    true
                } else {
                    info!(task = %key, handle, "Worker not alive, re-checking next tick");
                    false
                }
            }
            Err(e) => {
                warn!(task = %key, error = %e, "Liveness probe failed");
                false
            }
        }
    }

    async fn request_stop(&self, job_id: &str, status: Status, reason: String) {
        warn!(job_id, status = %status, reason = %reason, "Requesting job stop");
        if let Err(e) = self.party.request_stop(job_id, status, Some(reason)).await {
            error!(job_id, error = %e, "Stop request failed");
        }
    }

    /// Kill workers of tasks that ended without their worker being killed.
    async fn kill_ended_workers(&self) -> Result<(), Error> {
        let ended = self
            .ctx
            .db
            .query_tasks(&TaskFilter {
                party_id: Some(self.ctx.party_id().to_string()),
                party_statuses: TERMINAL.to_vec(),
                worker_instance: Some(self.ctx.instance_id().to_string()),
                ..Default::default()
            })
            .await?;
        for task in ended.into_iter().filter(|t| !t.kill_status && t.worker_handle.is_some()) {
            debug!(task = %task.key(), "Killing worker of ended task");
            if let Err(e) = self.party.stop_task(&task.key(), task.party_status).await {
                warn!(task = %task.key(), error = %e, "Failed to settle ended task");
            }
        }
        Ok(())
    }

    /// Return resources still held by finished tasks and jobs.
    async fn reclaim_resources(&self) -> Result<(), Error> {
        let ledger = self.party.ledger();
        let tasks = self
            .ctx
            .db
            .query_tasks(&TaskFilter {
                party_id: Some(self.ctx.party_id().to_string()),
                party_statuses: TERMINAL.to_vec(),
                resource_in_use: Some(true),
                ..Default::default()
            })
            .await?;
        for task in tasks {
            info!(task = %task.key(), "Reclaiming task resources");
            ledger.return_task(&task.key()).await?;
        }

        let jobs = self
            .ctx
            .db
            .query_jobs(&JobFilter {
                party_id: Some(self.ctx.party_id().to_string()),
                statuses: TERMINAL.to_vec(),
                resource_in_use: Some(true),
                ..Default::default()
            })
            .await?;
        for job in jobs {
            info!(job_id = %job.job_id, party = %job.party(), "Reclaiming job resources");
            ledger.return_job(&job.key()).await?;
        }
        Ok(())
    }

    async fn clear_expired_locks(&self) -> Result<(), Error> {
        for job_id in self.ctx.db.clear_expired_schedule_locks(Utc::now()).await? {
            warn!(job_id = %job_id, "Cleared expired schedule lock");
        }
        Ok(())
    }

    /// Time out jobs this party schedules that waited too long for resources.
    async fn check_waiting_jobs(&self) -> Result<(), Error> {
        let waiting = self
            .ctx
            .db
            .query_jobs(&JobFilter {
                scheduler_party_id: Some(self.ctx.party_id().to_string()),
                statuses: vec![Status::Waiting],
                cancel_signal: Some(false),
                rerun_signal: Some(false),
                ..Default::default()
            })
            .await?;
        let now = Utc::now();
        let mut seen: HashSet<String> = HashSet::new();
        for job in waiting {
            if !seen.insert(job.job_id.clone()) {
                continue;
            }
            let budget = job.dag.conf.resource_wait_timeout_secs;
            let waited = (now - job.queued_at).num_seconds().max(0) as u64;
            if waited >= budget {
                let reason = format!("waited {waited}s for resources, budget {budget}s");
                self.request_stop(&job.job_id, Status::Timeout, reason).await;
            }
        }
        Ok(())
    }
}

/// Reason for a task that ran past its budget.
fn timed_out(task: &Task) -> Option<String> {
    let started = task.start_time?;
    if task.timeout_secs == 0 {
        return None;
    }
    let elapsed = (Utc::now() - started).num_seconds().max(0) as u64;
    (elapsed >= task.timeout_secs).then(|| {
        format!(
            "task {} ran {elapsed}s, budget {}s",
            task.key(),
            task.timeout_secs
        )
    })
}

/// Run [`Detector::tick`] every `interval` until the process exits.
pub fn spawn_detect_ticker(detector: Arc<Detector>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = detector.tick().await {
                error!(error = %e, "Detect tick failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DagSchema, PartyRef, TaskGraph};
    use crate::store::Job;

    fn task(timeout_secs: u64) -> Task {
        let dag = DagSchema::from_json(
            r#"{"parties": [{"role": "guest", "party_id": ["9999"]}], "tasks": {"a": {"component_ref": "a"}}}"#,
        )
        .unwrap();
        let graph = TaskGraph::build(dag.clone()).unwrap();
        let guest = PartyRef::new("guest", "9999");
        let job = Job::new("j1", &guest, dag, "9999", "9999");
        let mut task = Task::from_graph(&job, &graph, "a", &guest, 0);
        task.timeout_secs = timeout_secs;
        task
    }

    #[test]
    fn timeout_counts_from_start() {
        let mut t = task(5);
        assert!(timed_out(&t).is_none());

        t.start_time = Some(Utc::now() - chrono::Duration::seconds(2));
        assert!(timed_out(&t).is_none());

        t.start_time = Some(Utc::now() - chrono::Duration::seconds(10));
        assert!(timed_out(&t).unwrap().contains("budget 5s"));

        t.timeout_secs = 0;
        assert!(timed_out(&t).is_none());
    }
}
