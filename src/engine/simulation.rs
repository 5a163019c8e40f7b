//! Cost-free simulation engine.
//!
//! Workers finish instantly with synthetic output locations. Components can
//! be told to fail, to hang, or to vanish (the worker is gone but never
//! reported an outcome), which is how liveness and timeout handling are
//! exercised without real processes.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::{EngineStatus, LaunchSpec, TaskEngine};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    Fail,
    Hang,
    Vanish,
}

#[derive(Debug)]
struct SimWorker {
    behavior: Behavior,
    outputs: BTreeMap<String, String>,
    killed: bool,
}

/// Engine whose workers complete immediately.
pub struct SimulationEngine {
    accounts_resources: bool,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    vanishing: HashSet<String>,
    workers: Mutex<HashMap<String, SimWorker>>,
    launched: Mutex<Vec<String>>,
}

impl SimulationEngine {
    pub fn new() -> Self {
        Self {
            accounts_resources: false,
            failing: HashSet::new(),
            hanging: HashSet::new(),
            vanishing: HashSet::new(),
            workers: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Track resources like a real engine.
    pub fn with_resource_accounting(mut self) -> Self {
        self.accounts_resources = true;
        self
    }

    /// Workers of `component_ref` fail.
    pub fn failing(mut self, component_ref: impl Into<String>) -> Self {
        self.failing.insert(component_ref.into());
        self
    }

    /// Workers of `component_ref` run until killed.
    pub fn hanging(mut self, component_ref: impl Into<String>) -> Self {
        self.hanging.insert(component_ref.into());
        self
    }

    /// Workers of `component_ref` disappear without reporting.
    pub fn vanishing(mut self, component_ref: impl Into<String>) -> Self {
        self.vanishing.insert(component_ref.into());
        self
    }

    /// `task_name#version` of every launch, in launch order.
    pub async fn launched(&self) -> Vec<String> {
        self.launched.lock().await.clone()
    }

    fn behavior_for(&self, component_ref: &str) -> Behavior {
        if self.failing.contains(component_ref) {
            Behavior::Fail
        } else if self.hanging.contains(component_ref) {
            Behavior::Hang
        } else if self.vanishing.contains(component_ref) {
            Behavior::Vanish
        } else {
            Behavior::Succeed
        }
    }
}

impl Default for SimulationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskEngine for SimulationEngine {
    fn name(&self) -> &str {
        "simulation"
    }

    fn accounts_resources(&self) -> bool {
        self.accounts_resources
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<String, EngineError> {
        let handle = format!("sim-{}", uuid::Uuid::new_v4());
        let outputs = spec
            .outputs
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    format!("sim://{}/{}/{}", spec.party_id, spec.worker_dir_name(), key),
                )
            })
            .collect();
        self.workers.lock().await.insert(
            handle.clone(),
            SimWorker {
                behavior: self.behavior_for(&spec.component_ref),
                outputs,
                killed: false,
            },
        );
        self.launched
            .lock()
            .await
            .push(format!("{}#{}", spec.task_name, spec.task_version));
        Ok(handle)
    }

    async fn kill(&self, handle: &str) -> Result<(), EngineError> {
        if let Some(worker) = self.workers.lock().await.get_mut(handle) {
            worker.killed = true;
        }
        Ok(())
    }

    async fn is_alive(&self, handle: &str) -> Result<bool, EngineError> {
        Ok(match self.workers.lock().await.get(handle) {
            Some(worker) => !worker.killed && worker.behavior == Behavior::Hang,
            None => false,
        })
    }

    async fn query_status(&self, handle: &str) -> Result<EngineStatus, EngineError> {
        let workers = self.workers.lock().await;
        let Some(worker) = workers.get(handle) else {
            return Ok(EngineStatus::Unknown);
        };
        if worker.killed {
            return Ok(EngineStatus::Failed {
                reason: "killed".to_string(),
            });
        }
        Ok(match worker.behavior {
            Behavior::Succeed => EngineStatus::Success {
                outputs: worker.outputs.clone(),
            },
            Behavior::Fail => EngineStatus::Failed {
                reason: "simulated failure".to_string(),
            },
            Behavior::Hang | Behavior::Vanish => EngineStatus::Running,
        })
    }
}
