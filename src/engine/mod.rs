//! Compute engines.
//!
//! An engine launches the worker of one task version at this party and
//! answers liveness and status queries about it. Engines are looked up by
//! name in an [`EngineRegistry`]; the job's `conf.engine` picks one.

pub mod process;
pub mod simulation;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::dag::ResolvedInput;
use crate::error::EngineError;
use crate::store::Task;

pub use process::ProcessEngine;
pub use simulation::SimulationEngine;

/// Everything a worker needs to run one task version at one party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub job_id: String,
    pub task_id: String,
    pub task_version: u32,
    pub task_name: String,
    pub component_ref: String,
    pub role: String,
    pub party_id: String,
    pub cores: u32,
    pub inputs: IndexMap<String, ResolvedInput>,
    /// Declared output keys.
    pub outputs: Vec<String>,
}

impl LaunchSpec {
    pub fn for_task(task: &Task, outputs: Vec<String>) -> Self {
        Self {
            job_id: task.job_id.clone(),
            task_id: task.task_id.clone(),
            task_version: task.task_version,
            task_name: task.task_name.clone(),
            component_ref: task.component_ref.clone(),
            role: task.role.clone(),
            party_id: task.party_id.clone(),
            cores: task.task_cores,
            inputs: task.inputs.clone(),
            outputs,
        }
    }

    /// Per-worker directory name, unique per task version and party.
    pub fn worker_dir_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.task_id, self.task_version, self.role, self.party_id
        )
    }
}

/// What an engine knows about a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Running,
    /// Finished; output key → location.
    Success { outputs: BTreeMap<String, String> },
    Failed { reason: String },
    /// The engine has no record of the handle.
    Unknown,
}

/// Capability interface of a compute engine.
#[async_trait]
pub trait TaskEngine: Send + Sync {
    /// Registry key, matched against `conf.engine`.
    fn name(&self) -> &str;

    /// Engines that cost nothing skip resource accounting.
    fn accounts_resources(&self) -> bool {
        true
    }

    /// Launch a worker. Returns its handle.
    async fn run(&self, spec: &LaunchSpec) -> Result<String, EngineError>;

    /// Stop a worker. Killing an unknown or finished worker is not an error.
    async fn kill(&self, handle: &str) -> Result<(), EngineError>;

    async fn is_alive(&self, handle: &str) -> Result<bool, EngineError>;

    async fn query_status(&self, handle: &str) -> Result<EngineStatus, EngineError>;
}

/// Engines available at this party, by name.
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn TaskEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Register an engine, replacing any engine of the same name.
    pub async fn register(&self, engine: Arc<dyn TaskEngine>) {
        let name = engine.name().to_string();
        if self.engines.write().await.insert(name.clone(), engine).is_some() {
            tracing::warn!(engine = %name, "Replaced registered engine");
        } else {
            tracing::debug!("Registered engine: {}", name);
        }
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn TaskEngine>, EngineError> {
        self.engines
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered {
                name: name.to_string(),
            })
    }

    /// Whether `name` tracks resources. Unknown engines are assumed to.
    pub async fn accounts_resources(&self, name: &str) -> bool {
        match self.engines.read().await.get(name) {
            Some(engine) => engine.accounts_resources(),
            None => true,
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
