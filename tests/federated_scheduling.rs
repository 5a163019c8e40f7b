//! End-to-end scheduling across parties.
//!
//! Each test builds a guest (scheduling) party and a host party, each with
//! its own in-memory store and simulation engine, wired together over the
//! in-process loopback transport. Scheduler and detector ticks are driven by
//! hand so every step is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use fedflow::config::Config;
use fedflow::dag::{DagSchema, PartyRef};
use fedflow::engine::{EngineRegistry, SimulationEngine};
use fedflow::error::{Error, JobError};
use fedflow::federation::{LoopbackFederation, RetryPolicy};
use fedflow::node::Node;
use fedflow::status::Status;
use fedflow::store::{Database, Job, JobFilter, LibSqlBackend, Task, TaskFilter};

const GUEST: &str = "9999";
const HOST: &str = "10000";

/// Maximum scheduler ticks before a job is considered stuck.
const MAX_TICKS: usize = 20;

struct Party {
    node: Node,
    engine: Arc<SimulationEngine>,
}

struct Cluster {
    loopback: Arc<LoopbackFederation>,
    parties: HashMap<&'static str, Party>,
}

impl Cluster {
    async fn new(guest: SimulationEngine, host: SimulationEngine) -> Self {
        Self::with_cores(guest, 16, host, 16).await
    }

    async fn with_cores(guest: SimulationEngine, guest_cores: u32, host: SimulationEngine, host_cores: u32) -> Self {
        let loopback = Arc::new(LoopbackFederation::new());
        let mut parties = HashMap::new();
        for (party_id, engine, cores) in [(GUEST, guest, guest_cores), (HOST, host, host_cores)] {
            let mut config = Config::for_party(party_id);
            config.total_cores = cores;
            config.retry = RetryPolicy::immediate(1);

            let engine = Arc::new(engine);
            let engines = Arc::new(EngineRegistry::new());
            engines.register(engine.clone()).await;
            let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

            let node = Node::start(config, db, engines, loopback.clone()).await.unwrap();
            loopback.register(party_id, &node.service()).await;
            parties.insert(party_id, Party { node, engine });
        }
        Self { loopback, parties }
    }

    /// Rebuild a party on its store with a fresh engine, as after a process
    /// restart under the same instance id.
    async fn restart(&mut self, party_id: &'static str, engine: SimulationEngine) {
        let old = self.parties.remove(party_id).unwrap();
        let config = (*old.node.ctx.config).clone();
        let db = Arc::clone(&old.node.ctx.db);
        drop(old);

        let engine = Arc::new(engine);
        let engines = Arc::new(EngineRegistry::new());
        engines.register(engine.clone()).await;
        let node = Node::start(config, db, engines, self.loopback.clone()).await.unwrap();
        self.loopback.register(party_id, &node.service()).await;
        self.parties.insert(party_id, Party { node, engine });
    }

    fn node(&self, party_id: &str) -> &Node {
        &self.parties[party_id].node
    }

    async fn launched(&self, party_id: &str) -> Vec<String> {
        self.parties[party_id].engine.launched().await
    }

    async fn submit(&self, dag: DagSchema) -> String {
        self.node(GUEST).jobs.create_job(dag).await.unwrap()
    }

    async fn tick(&self) {
        self.node(GUEST).scheduler.tick().await.unwrap();
    }

    async fn detect(&self, party_id: &str) {
        self.node(party_id).detector.tick().await.unwrap();
    }

    async fn job(&self, party_id: &str, job_id: &str) -> Job {
        self.node(party_id).ctx.any_job(job_id).await.unwrap()
    }

    /// Latest records of one task held by `party_id`.
    async fn task_rows(&self, party_id: &str, job_id: &str, task_name: &str) -> Vec<Task> {
        self.node(party_id)
            .ctx
            .latest_tasks(&TaskFilter::job(job_id))
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.task_name == task_name)
            .collect()
    }

    async fn remaining_cores(&self, party_id: &str) -> u32 {
        self.node(party_id)
            .ctx
            .db
            .get_engine_pool("simulation")
            .await
            .unwrap()
            .unwrap()
            .remaining_cores
    }

    /// Tick until the job reaches a terminal status.
    async fn run_to_end(&self, job_id: &str) -> Status {
        for _ in 0..MAX_TICKS {
            self.tick().await;
            let status = self.job(GUEST, job_id).await.status;
            if status.is_terminal() {
                return status;
            }
        }
        panic!("job {job_id} did not finish within {MAX_TICKS} ticks");
    }

    /// Tick until `party_id` launched `entry`.
    async fn run_until_launched(&self, party_id: &str, entry: &str) {
        for _ in 0..MAX_TICKS {
            self.tick().await;
            if self.launched(party_id).await.iter().any(|e| e == entry) {
                return;
            }
        }
        panic!("{entry} never launched at {party_id}");
    }
}

/// `reader` feeds `train` at both parties.
fn chain(conf: Value) -> DagSchema {
    serde_json::from_value(json!({
        "parties": [
            {"role": "guest", "party_id": [GUEST]},
            {"role": "host", "party_id": [HOST]}
        ],
        "tasks": {
            "reader": {"component_ref": "reader", "outputs": ["data"]},
            "train": {
                "component_ref": "lr",
                "dependent_tasks": ["reader"],
                "inputs": {"train_data": {"type": "task_output", "task": "reader", "output": "data"}},
                "outputs": ["model"]
            }
        },
        "conf": conf
    }))
    .unwrap()
}

#[tokio::test]
async fn dag_runs_in_dependency_order() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new()).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Waiting);

    assert_eq!(cluster.run_to_end(&job_id).await, Status::Success);
    for party in [GUEST, HOST] {
        assert_eq!(cluster.launched(party).await, vec!["reader#0", "train#0"]);
        assert_eq!(cluster.job(party, &job_id).await.status, Status::Success);
    }

    // The host's trainer read the reader output produced at the host.
    let train = cluster.task_rows(HOST, &job_id, "train").await;
    let inputs = serde_json::to_value(&train[0].inputs).unwrap();
    assert!(inputs.to_string().contains(&format!("sim://{HOST}/")));

    let summary = cluster.node(GUEST).jobs.describe_job(&job_id).await.unwrap();
    assert_eq!(summary.tasks.len(), 2);
    assert!(summary.tasks.values().flatten().all(|t| t.status == Status::Success));
    assert!(summary.tasks.values().all(|rows| rows.len() == 2));
}

#[tokio::test]
async fn failed_task_fails_job() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new().failing("lr")).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;

    assert_eq!(cluster.run_to_end(&job_id).await, Status::Failed);
    assert_eq!(cluster.job(HOST, &job_id).await.status, Status::Failed);
    let train = cluster.task_rows(GUEST, &job_id, "train").await;
    assert!(train.iter().all(|t| t.status == Status::Failed));
    let host_row = train.iter().find(|t| t.party_id == HOST).unwrap();
    assert_eq!(host_row.party_status, Status::Failed);
}

#[tokio::test]
async fn interrupted_task_is_retried_as_new_version() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new().failing("lr")).await;
    let job_id = cluster
        .submit(chain(json!({"engine": "simulation", "auto_retries": 1})))
        .await;

    assert_eq!(cluster.run_to_end(&job_id).await, Status::Failed);
    assert_eq!(cluster.launched(HOST).await, vec!["reader#0", "train#0", "train#1"]);
    let train = cluster.task_rows(GUEST, &job_id, "train").await;
    assert!(train.iter().all(|t| t.task_version == 1 && t.auto_retries == 0));
}

#[tokio::test]
async fn denied_task_stays_waiting_until_resources_return() {
    let cluster = Cluster::with_cores(
        SimulationEngine::new().with_resource_accounting(),
        1,
        SimulationEngine::new().with_resource_accounting(),
        1,
    )
    .await;
    let dag: DagSchema = serde_json::from_value(json!({
        "parties": [
            {"role": "guest", "party_id": [GUEST]},
            {"role": "host", "party_id": [HOST]}
        ],
        "tasks": {
            "left": {"component_ref": "reader"},
            "right": {"component_ref": "reader"}
        },
        "conf": {"engine": "simulation", "task_cores": 1, "task_parallelism": 1}
    }))
    .unwrap();
    let job_id = cluster.submit(dag).await;

    // Start: both parties reserve their single core for the job.
    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Running);
    assert_eq!(cluster.remaining_cores(GUEST).await, 0);
    assert_eq!(cluster.remaining_cores(HOST).await, 0);

    // Only one task fits the job reservation.
    cluster.tick().await;
    assert_eq!(cluster.launched(GUEST).await.len(), 1);
    let waiting = if cluster.launched(GUEST).await[0] == "left#0" { "right" } else { "left" };
    let rows = cluster.task_rows(GUEST, &job_id, waiting).await;
    assert!(rows.iter().all(|t| t.status == Status::Waiting && !t.resource_in_use));

    assert_eq!(cluster.run_to_end(&job_id).await, Status::Success);
    assert_eq!(cluster.launched(GUEST).await.len(), 2);
    assert_eq!(cluster.remaining_cores(GUEST).await, 1);
    assert_eq!(cluster.remaining_cores(HOST).await, 1);
}

#[tokio::test]
async fn task_denied_at_one_party_returns_cores_granted_at_the_other() {
    let cluster = Cluster::with_cores(
        SimulationEngine::new().with_resource_accounting(),
        1,
        SimulationEngine::new().with_resource_accounting().hanging("holder"),
        1,
    )
    .await;
    let dag: DagSchema = serde_json::from_value(json!({
        "parties": [
            {"role": "guest", "party_id": [GUEST]},
            {"role": "host", "party_id": [HOST]}
        ],
        "tasks": {
            "hold": {"component_ref": "holder", "parties": [{"role": "host", "party_id": [HOST]}]},
            "both": {"component_ref": "reader"}
        },
        "conf": {"engine": "simulation", "task_cores": 1, "task_parallelism": 1}
    }))
    .unwrap();
    let job_id = cluster.submit(dag).await;
    let guest = PartyRef::new("guest", GUEST);
    let host = PartyRef::new("host", HOST);

    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Running);

    // `hold` takes the host's only job core, so `both` is granted at the
    // guest, denied at the host and handed back at the guest.
    cluster.tick().await;
    assert_eq!(cluster.launched(HOST).await, vec!["hold#0"]);
    assert!(cluster.launched(GUEST).await.is_empty());

    let guest_job = cluster.node(GUEST).ctx.job(&job_id, &guest).await.unwrap();
    assert_eq!(guest_job.remaining_cores, 1);
    let host_job = cluster.node(HOST).ctx.job(&job_id, &host).await.unwrap();
    assert_eq!(host_job.remaining_cores, 0);

    let both = cluster.task_rows(GUEST, &job_id, "both").await;
    assert_eq!(both.len(), 2);
    assert!(both.iter().all(|t| t.status == Status::Waiting && !t.resource_in_use));

    // Still denied on the next pass.
    cluster.tick().await;
    assert!(cluster.launched(GUEST).await.is_empty());
    let guest_job = cluster.node(GUEST).ctx.job(&job_id, &guest).await.unwrap();
    assert_eq!(guest_job.remaining_cores, 1);
}

#[tokio::test]
async fn job_waiting_too_long_for_resources_times_out() {
    let cluster = Cluster::with_cores(
        SimulationEngine::new().with_resource_accounting(),
        4,
        SimulationEngine::new().with_resource_accounting(),
        1,
    )
    .await;
    let job_id = cluster
        .submit(chain(json!({
            "engine": "simulation",
            "task_cores": 2,
            "resource_wait_timeout_secs": 0
        })))
        .await;

    // The host cannot cover two cores; the guest's reservation is rolled back.
    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Waiting);
    assert_eq!(cluster.remaining_cores(GUEST).await, 4);
    assert_eq!(cluster.remaining_cores(HOST).await, 1);

    cluster.detect(GUEST).await;
    let job = cluster.job(GUEST, &job_id).await;
    assert!(job.cancel_signal);
    assert_eq!(job.stop_status, Some(Status::Timeout));

    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Timeout);
    assert_eq!(cluster.job(HOST, &job_id).await.status, Status::Timeout);
    assert!(cluster.launched(GUEST).await.is_empty());
}

#[tokio::test]
async fn vanished_worker_fails_job_after_two_probes() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new().vanishing("lr")).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;
    cluster.run_until_launched(HOST, "train#0").await;

    cluster.detect(HOST).await;
    assert!(!cluster.job(GUEST, &job_id).await.cancel_signal);

    cluster.detect(HOST).await;
    let job = cluster.job(GUEST, &job_id).await;
    assert!(job.cancel_signal);
    assert_eq!(job.stop_status, Some(Status::Failed));
    assert!(job.error_report.unwrap_or_default().contains("gone"));

    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Failed);
    assert_eq!(cluster.job(HOST, &job_id).await.status, Status::Failed);
}

#[tokio::test]
async fn worker_unknown_after_restart_needs_two_probes() {
    let mut cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new().hanging("lr")).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;
    cluster.run_until_launched(HOST, "train#0").await;

    // Same instance id; the new engine has never seen the worker.
    cluster.restart(HOST, SimulationEngine::new()).await;

    cluster.detect(HOST).await;
    let train = cluster.task_rows(HOST, &job_id, "train").await;
    let own = train.iter().find(|t| t.party_id == HOST).unwrap();
    assert_eq!(own.party_status, Status::Running);
    assert!(!cluster.job(GUEST, &job_id).await.cancel_signal);

    cluster.detect(HOST).await;
    let job = cluster.job(GUEST, &job_id).await;
    assert!(job.cancel_signal);
    assert_eq!(job.stop_status, Some(Status::Failed));

    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Failed);
}

#[tokio::test]
async fn task_past_its_budget_times_out_job() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new().hanging("lr")).await;
    let mut dag = chain(json!({"engine": "simulation"}));
    dag.tasks["train"].conf.timeout_secs = Some(1);
    let job_id = cluster.submit(dag).await;
    cluster.run_until_launched(HOST, "train#0").await;

    cluster.detect(HOST).await;
    assert!(!cluster.job(GUEST, &job_id).await.cancel_signal);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    cluster.detect(HOST).await;
    assert_eq!(cluster.job(GUEST, &job_id).await.stop_status, Some(Status::Timeout));

    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Timeout);
    let host_train = cluster.task_rows(HOST, &job_id, "train").await;
    assert_eq!(host_train[0].party_status, Status::Timeout);
    assert!(host_train[0].kill_status);
}

#[tokio::test]
async fn cancel_stops_running_job_and_clean_removes_it() {
    let cluster = Cluster::new(SimulationEngine::new().hanging("lr"), SimulationEngine::new().hanging("lr")).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;
    cluster.run_until_launched(GUEST, "train#0").await;

    let jobs = &cluster.node(GUEST).jobs;
    let err = jobs.clean_job(&job_id).await.unwrap_err();
    assert!(matches!(err, Error::Job(JobError::NotTerminal { .. })));

    jobs.cancel_job(&job_id).await.unwrap();
    cluster.tick().await;
    for party in [GUEST, HOST] {
        assert_eq!(cluster.job(party, &job_id).await.status, Status::Canceled);
        let train = cluster.task_rows(party, &job_id, "train").await;
        let own = train.iter().find(|t| t.party_id == party).unwrap();
        assert_eq!(own.party_status, Status::Canceled);
        assert!(own.kill_status);
    }

    // Canceling a finished job changes nothing.
    jobs.cancel_job(&job_id).await.unwrap();
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Canceled);

    jobs.clean_job(&job_id).await.unwrap();
    for party in [GUEST, HOST] {
        let db = &cluster.node(party).ctx.db;
        assert!(db.query_jobs(&JobFilter::job(&job_id)).await.unwrap().is_empty());
        assert!(db.query_tasks(&TaskFilter::job(&job_id)).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn rerun_replays_only_unsuccessful_tasks() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new().failing("lr")).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;
    assert_eq!(cluster.run_to_end(&job_id).await, Status::Failed);

    let jobs = &cluster.node(GUEST).jobs;
    jobs.rerun_job(&job_id).await.unwrap();
    cluster.tick().await;
    let job = cluster.job(GUEST, &job_id).await;
    assert_eq!(job.status, Status::Waiting);
    assert!(!job.rerun_signal && !job.cancel_signal);
    assert_eq!(cluster.job(HOST, &job_id).await.status, Status::Waiting);

    assert_eq!(cluster.run_to_end(&job_id).await, Status::Failed);
    assert_eq!(cluster.launched(HOST).await, vec!["reader#0", "train#0", "train#1"]);
    assert_eq!(cluster.launched(GUEST).await, vec!["reader#0", "train#0", "train#1"]);
}

#[tokio::test]
async fn manual_rerun_keeps_retry_budget() {
    let cluster = Cluster::new(SimulationEngine::new().hanging("lr"), SimulationEngine::new().hanging("lr")).await;
    let job_id = cluster
        .submit(chain(json!({"engine": "simulation", "auto_retries": 1})))
        .await;
    cluster.run_until_launched(GUEST, "train#0").await;

    let jobs = &cluster.node(GUEST).jobs;
    jobs.cancel_job(&job_id).await.unwrap();
    cluster.tick().await;
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Canceled);

    jobs.rerun_job(&job_id).await.unwrap();
    cluster.tick().await;
    for party in [GUEST, HOST] {
        let train = cluster.task_rows(party, &job_id, "train").await;
        assert!(!train.is_empty());
        assert!(train.iter().all(|t| t.task_version == 1 && t.auto_retries == 1));
    }
}

#[tokio::test]
async fn rerun_requires_finished_job() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new()).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;
    let err = cluster.node(GUEST).jobs.rerun_job(&job_id).await.unwrap_err();
    assert!(matches!(err, Error::Job(JobError::NotRerunnable { .. })));
}

#[tokio::test]
async fn callback_parties_report_their_own_status() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new()).await;
    let job_id = cluster
        .submit(chain(json!({"engine": "simulation", "sync_type": "callback"})))
        .await;

    let mut status = Status::Waiting;
    for _ in 0..MAX_TICKS {
        cluster.tick().await;
        cluster.detect(GUEST).await;
        cluster.detect(HOST).await;
        status = cluster.job(GUEST, &job_id).await.status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, Status::Success);
    let host_view = cluster.task_rows(GUEST, &job_id, "train").await;
    let host_row = host_view.iter().find(|t| t.party_id == HOST).unwrap();
    assert_eq!(host_row.party_status, Status::Success);
    assert!(host_row.outputs.contains_key("model"));
}

#[tokio::test]
async fn concurrent_ticks_launch_each_task_once() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new()).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;

    for _ in 0..MAX_TICKS {
        tokio::join!(cluster.tick(), cluster.tick());
        if cluster.job(GUEST, &job_id).await.status.is_terminal() {
            break;
        }
    }
    assert_eq!(cluster.job(GUEST, &job_id).await.status, Status::Success);
    assert_eq!(cluster.launched(GUEST).await, vec!["reader#0", "train#0"]);
    assert_eq!(cluster.launched(HOST).await, vec!["reader#0", "train#0"]);
}

#[tokio::test]
async fn unreachable_party_rolls_back_job_creation() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new()).await;
    cluster.loopback.partition(HOST).await;

    let err = cluster
        .node(GUEST)
        .jobs
        .create_job(chain(json!({"engine": "simulation"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Job(JobError::CreateFailed { .. })));
    for party in [GUEST, HOST] {
        let jobs = cluster
            .node(party)
            .ctx
            .db
            .query_jobs(&JobFilter::default())
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    cluster.loopback.heal(HOST).await;
    let job_id = cluster.submit(chain(json!({"engine": "simulation"}))).await;
    assert_eq!(cluster.run_to_end(&job_id).await, Status::Success);
}

#[tokio::test]
async fn invalid_dag_is_rejected_before_any_party_is_contacted() {
    let cluster = Cluster::new(SimulationEngine::new(), SimulationEngine::new()).await;
    let dag: DagSchema = serde_json::from_value(json!({
        "parties": [{"role": "guest", "party_id": [GUEST]}],
        "tasks": {
            "a": {"component_ref": "a", "dependent_tasks": ["b"]},
            "b": {"component_ref": "b", "dependent_tasks": ["a"]}
        }
    }))
    .unwrap();
    let err = cluster.node(GUEST).jobs.create_job(dag).await.unwrap_err();
    assert!(matches!(err, Error::Dag(_)));
    assert!(
        cluster
            .node(GUEST)
            .ctx
            .db
            .query_jobs(&JobFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}
