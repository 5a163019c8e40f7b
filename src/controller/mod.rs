//! Job and task lifecycle.
//!
//! [`JobController`] and [`TaskController`] run at the scheduling party and
//! federate each operation to every party involved; [`PartyController`]
//! applies the effect of a command to the records held by one party.

pub mod job;
pub mod party;
pub mod task;

pub use job::{JobController, JobSummary};
pub use party::PartyController;
pub use task::TaskController;
