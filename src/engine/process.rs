//! OS process engine.
//!
//! Runs each task version as `sh -c <command>` with the task described in
//! environment variables:
//!
//! | Variable | Value |
//! |---|---|
//! | `FEDFLOW_JOB_ID`, `FEDFLOW_TASK_ID`, `FEDFLOW_TASK_VERSION` | identity |
//! | `FEDFLOW_TASK_NAME`, `FEDFLOW_COMPONENT` | DAG node |
//! | `FEDFLOW_ROLE`, `FEDFLOW_PARTY_ID` | party |
//! | `FEDFLOW_CORES` | granted cores |
//! | `FEDFLOW_INPUTS` | resolved inputs as JSON |
//! | `FEDFLOW_OUTPUT_DIR` | directory the worker writes its outputs into |
//!
//! Exit code 0 is success; output `key` is then located at
//! `<output dir>/<key>`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::{EngineStatus, LaunchSpec, TaskEngine};
use crate::error::EngineError;

const ENGINE_NAME: &str = "process";

struct Worker {
    child: Child,
    output_dir: PathBuf,
    outputs: Vec<String>,
    exit: Option<ExitStatus>,
}

impl Worker {
    /// Reap the child if it exited.
    fn poll(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }
}

/// Launches workers as child processes of this instance.
pub struct ProcessEngine {
    command: String,
    output_root: PathBuf,
    workers: Mutex<HashMap<String, Worker>>,
}

impl ProcessEngine {
    pub fn new(command: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            output_root: output_root.into(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn launch_failed(spec: &LaunchSpec, reason: impl ToString) -> EngineError {
        EngineError::LaunchFailed {
            engine: ENGINE_NAME.to_string(),
            task_id: spec.task_id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl TaskEngine for ProcessEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<String, EngineError> {
        let output_dir = self.output_root.join(spec.worker_dir_name());
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| Self::launch_failed(spec, format!("output dir: {e}")))?;

        let inputs = serde_json::to_string(&spec.inputs)
            .map_err(|e| Self::launch_failed(spec, format!("inputs: {e}")))?;

        let child = Command::new("sh")
            .args(["-c", &self.command])
            .current_dir(&output_dir)
            .env("FEDFLOW_JOB_ID", &spec.job_id)
            .env("FEDFLOW_TASK_ID", &spec.task_id)
            .env("FEDFLOW_TASK_VERSION", spec.task_version.to_string())
            .env("FEDFLOW_TASK_NAME", &spec.task_name)
            .env("FEDFLOW_COMPONENT", &spec.component_ref)
            .env("FEDFLOW_ROLE", &spec.role)
            .env("FEDFLOW_PARTY_ID", &spec.party_id)
            .env("FEDFLOW_CORES", spec.cores.to_string())
            .env("FEDFLOW_INPUTS", inputs)
            .env("FEDFLOW_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::launch_failed(spec, format!("spawn: {e}")))?;

        let handle = match child.id() {
            Some(pid) => pid.to_string(),
            None => format!("{}-{}", spec.worker_dir_name(), uuid::Uuid::new_v4()),
        };
        info!(task_id = %spec.task_id, version = spec.task_version, handle = %handle, "Worker process started");

        self.workers.lock().await.insert(
            handle.clone(),
            Worker {
                child,
                output_dir,
                outputs: spec.outputs.clone(),
                exit: None,
            },
        );
        Ok(handle)
    }

    async fn kill(&self, handle: &str) -> Result<(), EngineError> {
        let Some(mut worker) = self.workers.lock().await.remove(handle) else {
            debug!(handle, "Kill of unknown worker ignored");
            return Ok(());
        };
        if worker.exit.is_some() {
            return Ok(());
        }
        worker.child.kill().await.map_err(|e| EngineError::KillFailed {
            engine: ENGINE_NAME.to_string(),
            handle: handle.to_string(),
            reason: e.to_string(),
        })?;
        info!(handle, "Worker process killed");
        Ok(())
    }

    async fn is_alive(&self, handle: &str) -> Result<bool, EngineError> {
        let mut workers = self.workers.lock().await;
        let Some(worker) = workers.get_mut(handle) else {
            return Ok(false);
        };
        match worker.poll() {
            Ok(exit) => Ok(exit.is_none()),
            Err(e) => {
                warn!(handle, error = %e, "Worker liveness probe failed");
                Ok(false)
            }
        }
    }

    async fn query_status(&self, handle: &str) -> Result<EngineStatus, EngineError> {
        let mut workers = self.workers.lock().await;
        let Some(worker) = workers.get_mut(handle) else {
            return Ok(EngineStatus::Unknown);
        };
        let exit = worker.poll().map_err(|e| EngineError::UnknownHandle {
            engine: ENGINE_NAME.to_string(),
            handle: format!("{handle} ({e})"),
        })?;
        Ok(match exit {
            None => EngineStatus::Running,
            Some(status) if status.success() => {
                let outputs: BTreeMap<String, String> = worker
                    .outputs
                    .iter()
                    .map(|key| {
                        (
                            key.clone(),
                            worker.output_dir.join(key).to_string_lossy().into_owned(),
                        )
                    })
                    .collect();
                EngineStatus::Success { outputs }
            }
            Some(status) => EngineStatus::Failed {
                reason: format!("worker exited with {status}"),
            },
        })
    }
}
