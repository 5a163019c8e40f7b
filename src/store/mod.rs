//! Persistence layer: libSQL-backed storage for jobs, tasks and engine pools.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::{
    EnginePool, Job, JobFilter, JobKey, JobUpdate, RerunCause, StatusField, Task, TaskFilter, TaskKey,
    TaskUpdate, latest_versions, task_id_for,
};
pub use traits::Database;
