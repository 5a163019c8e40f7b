//! DAG submission schema.
//!
//! ```json
//! {
//!   "parties": [{"role": "guest", "party_id": ["9999"]}, {"role": "host", "party_id": ["10000"]}],
//!   "tasks": {
//!     "reader": {"component_ref": "reader", "outputs": ["data"]},
//!     "train": {
//!       "component_ref": "hetero_lr",
//!       "inputs": {"train_data": {"type": "task_output", "task": "reader", "output": "data"}}
//!     }
//!   },
//!   "conf": {"engine": "process", "task_cores": 2}
//! }
//! ```
//!
//! `tasks` keeps declaration order; it breaks ties in the topological order.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::DagError;

/// One participant of a job: a party acting in a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyRef {
    pub role: String,
    pub party_id: String,
}

impl PartyRef {
    pub fn new(role: impl Into<String>, party_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            party_id: party_id.into(),
        }
    }
}

impl std::fmt::Display for PartyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role, self.party_id)
    }
}

/// Parties that play one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySpec {
    pub role: String,
    pub party_id: Vec<String>,
}

impl PartySpec {
    fn refs(&self) -> impl Iterator<Item = PartyRef> + '_ {
        self.party_id
            .iter()
            .map(|party_id| PartyRef::new(self.role.clone(), party_id.clone()))
    }
}

/// Flatten a party list into `(role, party_id)` pairs, keeping declaration order
/// and dropping duplicates.
pub fn expand_parties(specs: &[PartySpec]) -> Vec<PartyRef> {
    let mut out: Vec<PartyRef> = Vec::new();
    for party in specs.iter().flat_map(PartySpec::refs) {
        if !out.contains(&party) {
            out.push(party);
        }
    }
    out
}

/// How the scheduling party learns per-party task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// The scheduler collects status from every party each pass.
    #[default]
    Poll,
    /// Parties report status changes to the scheduler.
    Callback,
}

/// Job-wide runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConf {
    /// Registered engine name that runs the tasks.
    pub engine: String,
    /// Cores each task applies for at every party.
    pub task_cores: u32,
    /// Tasks a job may run concurrently at one party.
    pub task_parallelism: u32,
    /// Automatic reruns of an interrupted task before the job fails.
    pub auto_retries: u32,
    /// Wall-clock budget of a task, from its start.
    pub task_timeout_secs: u64,
    /// How long a job may wait for resources before it times out.
    pub resource_wait_timeout_secs: u64,
    pub sync_type: SyncType,
}

impl Default for JobConf {
    fn default() -> Self {
        Self {
            engine: "process".to_string(),
            task_cores: 1,
            task_parallelism: 1,
            auto_retries: 0,
            task_timeout_secs: 3 * 24 * 3600,
            resource_wait_timeout_secs: 3600,
            sync_type: SyncType::Poll,
        }
    }
}

impl JobConf {
    /// Cores a job reserves at each party when it starts.
    pub fn job_cores(&self) -> u32 {
        self.task_cores.saturating_mul(self.task_parallelism.max(1))
    }
}

/// Per-task overrides of [`JobConf`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConf {
    #[serde(default)]
    pub task_cores: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub auto_retries: Option<u32>,
}

/// Where an input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    /// A table already present in the party's storage.
    Data { uri: String },
    /// A declared output of another task in this DAG.
    TaskOutput { task: String, output: String },
    /// An output registered by a task of a previous job.
    Model {
        job_id: String,
        task: String,
        output: String,
    },
}

/// One named input of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(flatten)]
    pub source: InputSource,
    /// Restrict the input to these parties; all of the task's parties when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parties: Option<Vec<PartySpec>>,
}

/// One DAG node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub component_ref: String,
    #[serde(default)]
    pub dependent_tasks: Vec<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, InputSpec>,
    /// Output keys other tasks may reference.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Task-level party override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parties: Option<Vec<PartySpec>>,
    #[serde(default)]
    pub conf: TaskConf,
}

/// A submitted job DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagSchema {
    pub parties: Vec<PartySpec>,
    pub tasks: IndexMap<String, TaskSpec>,
    #[serde(default)]
    pub conf: JobConf,
}

impl DagSchema {
    pub fn from_json(raw: &str) -> Result<Self, DagError> {
        serde_json::from_str(raw).map_err(|e| DagError::Invalid(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// `role -> [party_id]` for the whole job.
    pub fn roles(&self) -> BTreeMap<String, Vec<String>> {
        let mut roles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for party in expand_parties(&self.parties) {
            roles.entry(party.role).or_default().push(party.party_id);
        }
        roles
    }

    /// Every `(role, party_id)` of the job.
    pub fn job_parties(&self) -> Vec<PartyRef> {
        expand_parties(&self.parties)
    }
}
