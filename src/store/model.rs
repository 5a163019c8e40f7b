//! Job and task records.
//!
//! A job has one record per `(role, party_id)` it involves; a task has one
//! record per `(role, party_id)` per version. Tasks refer to their job by
//! `job_id` only; jobs never hold their tasks in memory.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::dag::{DagSchema, PartyRef, ResolvedInput, TaskGraph};
use crate::status::Status;

/// Why a new task version is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunCause {
    /// Requested for the job; keeps the task's retry budget.
    #[default]
    Manual,
    /// The scheduler retrying an interrupted task; uses up one retry.
    AutoRetry,
}

/// Primary key of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub job_id: String,
    pub role: String,
    pub party_id: String,
}

impl JobKey {
    pub fn new(job_id: impl Into<String>, party: &PartyRef) -> Self {
        Self {
            job_id: job_id.into(),
            role: party.role.clone(),
            party_id: party.party_id.clone(),
        }
    }
}

/// One party's record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub role: String,
    pub party_id: String,
    pub dag: DagSchema,
    pub roles: BTreeMap<String, Vec<String>>,
    pub initiator_party_id: String,
    pub scheduler_party_id: String,
    pub status: Status,
    pub resource_in_use: bool,
    /// Cores reserved for the job at this party.
    pub cores: u32,
    /// Reserved cores not yet handed to tasks.
    pub remaining_cores: u32,
    pub cancel_signal: bool,
    /// Status a pending stop request should land in.
    pub stop_status: Option<Status>,
    pub rerun_signal: bool,
    /// Schedule lock.
    pub ready_signal: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub ready_lease_until: Option<DateTime<Utc>>,
    pub apply_resource_time: Option<DateTime<Utc>>,
    pub error_report: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// When the job last entered `Waiting`; the resource-wait clock.
    pub queued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        party: &PartyRef,
        dag: DagSchema,
        initiator_party_id: impl Into<String>,
        scheduler_party_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let roles = dag.roles();
        Self {
            job_id: job_id.into(),
            role: party.role.clone(),
            party_id: party.party_id.clone(),
            dag,
            roles,
            initiator_party_id: initiator_party_id.into(),
            scheduler_party_id: scheduler_party_id.into(),
            status: Status::Waiting,
            resource_in_use: false,
            cores: 0,
            remaining_cores: 0,
            cancel_signal: false,
            stop_status: None,
            rerun_signal: false,
            ready_signal: false,
            ready_time: None,
            ready_lease_until: None,
            apply_resource_time: None,
            error_report: None,
            created_at: now,
            start_time: None,
            end_time: None,
            updated_at: now,
            queued_at: now,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            job_id: self.job_id.clone(),
            role: self.role.clone(),
            party_id: self.party_id.clone(),
        }
    }

    pub fn party(&self) -> PartyRef {
        PartyRef::new(self.role.clone(), self.party_id.clone())
    }

    pub fn parties(&self) -> Vec<PartyRef> {
        self.dag.job_parties()
    }
}

/// Stable task identifier of a DAG node within a job.
pub fn task_id_for(job_id: &str, task_name: &str) -> String {
    format!("{job_id}_{task_name}")
}

/// Primary key of a task record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub task_id: String,
    pub task_version: u32,
    pub role: String,
    pub party_id: String,
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}@{}:{}",
            self.task_id, self.task_version, self.role, self.party_id
        )
    }
}

/// One party's record of one task version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub job_id: String,
    pub task_name: String,
    pub task_id: String,
    pub task_version: u32,
    pub role: String,
    pub party_id: String,
    pub component_ref: String,
    /// Aggregate status, owned by the scheduling party.
    pub status: Status,
    /// This party's own view.
    pub party_status: Status,
    pub dependent_tasks: Vec<String>,
    pub scheduler_party_id: String,
    pub engine: String,
    pub task_cores: u32,
    pub resource_in_use: bool,
    /// Automatic reruns left.
    pub auto_retries: u32,
    pub timeout_secs: u64,
    pub worker_handle: Option<String>,
    /// Instance that launched the worker.
    pub worker_instance: Option<String>,
    pub kill_status: bool,
    pub inputs: IndexMap<String, ResolvedInput>,
    /// Output key → location.
    pub outputs: BTreeMap<String, String>,
    pub error_report: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build the record of `task_name` at `party` from the job's graph.
    pub fn from_graph(
        job: &Job,
        graph: &TaskGraph,
        task_name: &str,
        party: &PartyRef,
        task_version: u32,
    ) -> Self {
        let now = Utc::now();
        let conf = &graph.schema().conf;
        let task_conf = graph.task_spec(task_name).map(|s| s.conf.clone()).unwrap_or_default();
        Self {
            job_id: job.job_id.clone(),
            task_name: task_name.to_string(),
            task_id: task_id_for(&job.job_id, task_name),
            task_version,
            role: party.role.clone(),
            party_id: party.party_id.clone(),
            component_ref: graph
                .task_spec(task_name)
                .map(|s| s.component_ref.clone())
                .unwrap_or_default(),
            status: Status::Waiting,
            party_status: Status::Waiting,
            dependent_tasks: graph.dependent_tasks_of(task_name).to_vec(),
            scheduler_party_id: job.scheduler_party_id.clone(),
            engine: conf.engine.clone(),
            task_cores: task_conf.task_cores.unwrap_or(conf.task_cores),
            resource_in_use: false,
            auto_retries: task_conf.auto_retries.unwrap_or(conf.auto_retries),
            timeout_secs: task_conf.timeout_secs.unwrap_or(conf.task_timeout_secs),
            worker_handle: None,
            worker_instance: None,
            kill_status: false,
            inputs: graph.runtime_inputs(task_name, party),
            outputs: BTreeMap::new(),
            error_report: None,
            created_at: now,
            start_time: None,
            end_time: None,
            updated_at: now,
        }
    }

    /// A fresh row for the next version, reusing `task_id`.
    pub fn next_version(&self, task_version: u32, cause: RerunCause) -> Self {
        let now = Utc::now();
        let auto_retries = match cause {
            RerunCause::Manual => self.auto_retries,
            RerunCause::AutoRetry => self.auto_retries.saturating_sub(1),
        };
        Self {
            task_version,
            status: Status::Waiting,
            party_status: Status::Waiting,
            resource_in_use: false,
            auto_retries,
            worker_handle: None,
            worker_instance: None,
            kill_status: false,
            outputs: BTreeMap::new(),
            error_report: None,
            created_at: now,
            start_time: None,
            end_time: None,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            task_id: self.task_id.clone(),
            task_version: self.task_version,
            role: self.role.clone(),
            party_id: self.party_id.clone(),
        }
    }

    pub fn party(&self) -> PartyRef {
        PartyRef::new(self.role.clone(), self.party_id.clone())
    }
}

/// Keep only the highest version of every task id, preserving first-seen order.
pub fn latest_versions(tasks: Vec<Task>) -> Vec<Task> {
    let mut latest: HashMap<String, u32> = HashMap::new();
    for task in &tasks {
        let entry = latest.entry(task.task_id.clone()).or_insert(task.task_version);
        *entry = (*entry).max(task.task_version);
    }
    tasks
        .into_iter()
        .filter(|t| latest.get(&t.task_id) == Some(&t.task_version))
        .collect()
}

/// Which status column of a task to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    /// Aggregate status.
    Status,
    /// The party's own status.
    PartyStatus,
}

impl StatusField {
    pub(crate) fn column(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::PartyStatus => "party_status",
        }
    }
}

/// Free-form job fields. Status and `resource_in_use` are not here on
/// purpose: they only change through conditional updates.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub cancel_signal: Option<bool>,
    /// `Some(None)` clears the requested stop status.
    pub stop_status: Option<Option<Status>>,
    pub rerun_signal: Option<bool>,
    pub apply_resource_time: Option<DateTime<Utc>>,
    pub error_report: Option<String>,
}

/// Free-form task fields.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub worker_handle: Option<String>,
    pub worker_instance: Option<String>,
    pub kill_status: Option<bool>,
    pub inputs: Option<IndexMap<String, ResolvedInput>>,
    pub outputs: Option<BTreeMap<String, String>>,
    pub error_report: Option<String>,
}

impl TaskUpdate {
    /// Only `kill_status` may change once the party status is terminal.
    pub(crate) fn only_kill_status(&self) -> bool {
        self.worker_handle.is_none()
            && self.worker_instance.is_none()
            && self.inputs.is_none()
            && self.outputs.is_none()
            && self.error_report.is_none()
    }
}

/// Job query predicate. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_id: Option<String>,
    pub party: Option<PartyRef>,
    pub party_id: Option<String>,
    pub scheduler_party_id: Option<String>,
    pub statuses: Vec<Status>,
    pub resource_in_use: Option<bool>,
    pub cancel_signal: Option<bool>,
    pub rerun_signal: Option<bool>,
}

impl JobFilter {
    pub fn job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }
}

/// Task query predicate. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    pub task_version: Option<u32>,
    pub party: Option<PartyRef>,
    pub party_id: Option<String>,
    pub statuses: Vec<Status>,
    pub party_statuses: Vec<Status>,
    pub resource_in_use: Option<bool>,
    pub worker_instance: Option<String>,
}

impl TaskFilter {
    pub fn job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }
}

/// Core pool of one engine at this party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnginePool {
    pub total_cores: u32,
    pub remaining_cores: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> (Job, TaskGraph) {
        let dag = DagSchema::from_json(
            r#"{
                "parties": [{"role": "guest", "party_id": ["9999"]}],
                "tasks": {
                    "reader": {"component_ref": "reader", "outputs": ["data"]},
                    "train": {"component_ref": "lr", "dependent_tasks": ["reader"], "conf": {"task_cores": 3, "auto_retries": 2}}
                },
                "conf": {"task_cores": 1, "auto_retries": 1}
            }"#,
        )
        .unwrap();
        let party = PartyRef::new("guest", "9999");
        let job = Job::new("j1", &party, dag.clone(), "9999", "9999");
        (job, TaskGraph::build(dag).unwrap())
    }

    #[test]
    fn task_from_graph_applies_overrides() {
        let (job, graph) = graph();
        let party = job.party();
        let reader = Task::from_graph(&job, &graph, "reader", &party, 0);
        let train = Task::from_graph(&job, &graph, "train", &party, 0);
        assert_eq!(reader.task_id, "j1_reader");
        assert_eq!(reader.task_cores, 1);
        assert_eq!(reader.auto_retries, 1);
        assert_eq!(train.task_cores, 3);
        assert_eq!(train.auto_retries, 2);
        assert_eq!(train.dependent_tasks, vec!["reader"]);
        assert_eq!(train.status, Status::Waiting);
    }

    #[test]
    fn next_version_resets_runtime_state() {
        let (job, graph) = graph();
        let mut old = Task::from_graph(&job, &graph, "train", &job.party(), 0);
        old.party_status = Status::Failed;
        old.worker_handle = Some("42".into());
        let new = old.next_version(1, RerunCause::AutoRetry);
        assert_eq!(new.task_id, old.task_id);
        assert_eq!(new.task_version, 1);
        assert_eq!(new.party_status, Status::Waiting);
        assert_eq!(new.auto_retries, 1);
        assert!(new.worker_handle.is_none());
        assert_eq!(old.party_status, Status::Failed);
    }

    #[test]
    fn manual_rerun_keeps_retry_budget() {
        let (job, graph) = graph();
        let old = Task::from_graph(&job, &graph, "train", &job.party(), 0);
        assert_eq!(old.auto_retries, 2);
        assert_eq!(old.next_version(1, RerunCause::Manual).auto_retries, 2);
        assert_eq!(old.next_version(1, RerunCause::AutoRetry).auto_retries, 1);
    }

    #[test]
    fn latest_versions_keeps_highest() {
        let (job, graph) = graph();
        let t0 = Task::from_graph(&job, &graph, "train", &job.party(), 0);
        let t2 = t0.next_version(2, RerunCause::Manual);
        let t1 = t0.next_version(1, RerunCause::Manual);
        let reader = Task::from_graph(&job, &graph, "reader", &job.party(), 0);
        let latest = latest_versions(vec![t0, t2, reader, t1]);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].task_version, 2);
        assert_eq!(latest[1].task_name, "reader");
    }
}
