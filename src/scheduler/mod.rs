//! Scheduling at the scheduling party: the per-job lock, the task pass and
//! the periodic job loop.

pub mod job_scheduler;
pub mod lock;
pub mod task_scheduler;

pub use job_scheduler::{JobScheduler, spawn_schedule_ticker};
pub use lock::with_schedule_lock;
pub use task_scheduler::{SchedulingOutcome, TaskScheduler};
