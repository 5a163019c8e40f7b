//! Error types for fedflow.

use std::time::Duration;

use crate::status::Status;

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Structural DAG errors. Raised at parse time, before any party is contacted.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("DAG declares no tasks")]
    Empty,

    #[error("DAG declares no parties")]
    NoParties,

    #[error("Invalid task name '{0}'")]
    InvalidTaskName(String),

    #[error("Dependency cycle between tasks: {}", tasks.join(", "))]
    Cycle { tasks: Vec<String> },

    #[error("Task '{task}' depends on undeclared task '{upstream}'")]
    UnknownTask { task: String, upstream: String },

    #[error("Task '{task}' reads undeclared output '{output}' of task '{upstream}'")]
    UnknownOutput {
        task: String,
        upstream: String,
        output: String,
    },

    #[error("Task '{task}' runs on party {role}:{party_id} which the job does not declare")]
    UnknownParty {
        task: String,
        role: String,
        party_id: String,
    },

    #[error("Invalid DAG schema: {0}")]
    Invalid(String),
}

/// Status model errors.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Cannot merge an empty status list")]
    Empty,

    #[error("No merge rule matches statuses {0:?}")]
    Unmergeable(Vec<Status>),

    #[error("Unknown status '{0}'")]
    Unknown(String),
}

/// Federated transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("No address configured for party {party_id}")]
    UnknownPeer { party_id: String },

    #[error("Party {party_id} unreachable after {attempts} attempts: {reason}")]
    Unreachable {
        party_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Request to party {party_id} timed out after {timeout:?}")]
    Timeout { party_id: String, timeout: Duration },

    #[error("Undecodable response from party {party_id}: {reason}")]
    Decode { party_id: String, reason: String },
}

/// Compute engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine '{name}' is not registered")]
    NotRegistered { name: String },

    #[error("Engine {engine} failed to launch task {task_id}: {reason}")]
    LaunchFailed {
        engine: String,
        task_id: String,
        reason: String,
    },

    #[error("Engine {engine} has no worker with handle {handle}")]
    UnknownHandle { engine: String, handle: String },

    #[error("Engine {engine} failed to kill worker {handle}: {reason}")]
    KillFailed {
        engine: String,
        handle: String,
        reason: String,
    },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Task {task_id} version {version} not found")]
    TaskNotFound { task_id: String, version: u32 },

    #[error("Job {id} is {status}, expected a terminal status")]
    NotTerminal { id: String, status: Status },

    #[error("Job {id} is {status} and cannot be rerun")]
    NotRerunnable { id: String, status: Status },

    #[error("Task {task_id} rerun version {requested} must exceed current version {current}")]
    StaleVersion {
        task_id: String,
        current: u32,
        requested: u32,
    },

    #[error("Job {id} could not be created on every party: {detail}")]
    CreateFailed { id: String, detail: String },

    #[error("Federated {command} for job {id} failed: {detail}")]
    FederationFailed {
        id: String,
        command: String,
        detail: String,
    },
}

/// Result type alias for fedflow.
pub type Result<T> = std::result::Result<T, Error>;
