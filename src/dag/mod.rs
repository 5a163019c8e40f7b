//! DAG submission schema and the per-party task graph built from it.

pub mod graph;
pub mod schema;

pub use graph::{ResolvedInput, TaskGraph};
pub use schema::{DagSchema, InputSource, InputSpec, JobConf, PartyRef, PartySpec, SyncType, TaskConf, TaskSpec};
