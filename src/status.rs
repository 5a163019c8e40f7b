//! Status model shared by jobs and tasks.
//!
//! Statuses form a partial order of finality: queued (`Pending`, `Waiting`,
//! `Ready`) → `Running` → terminal (`Success`, `Pass`, `Failed`, `Canceled`,
//! `Timeout`, `Rejected`). Every status write in the store is guarded by
//! [`allowed_sources`], so no party observes a regression out of a terminal
//! status unless an administrative operation asks for it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StatusError;

/// Status of a job or task, at one party or aggregated across parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created but not yet acknowledged.
    Pending,
    /// Waiting for dependencies or resources.
    Waiting,
    /// Dependencies satisfied, about to be dispatched.
    Ready,
    Running,
    Success,
    /// Skipped; counts as success.
    Pass,
    Failed,
    Canceled,
    Timeout,
    /// A party refused the work.
    Rejected,
}

/// Coarse finality stage used by the transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Queued,
    Running,
    Terminal,
}

/// Whether a write is a regular status update or an administrative override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    Normal,
    /// Explicit stop or rerun: may leave a terminal status.
    Administrative,
}

/// Merge priority, highest first. Exactly one entry matches any non-empty,
/// non-uniform input.
const MERGE_PRIORITY: &[Status] = &[
    Status::Failed,
    Status::Canceled,
    Status::Timeout,
    Status::Rejected,
    Status::Running,
    Status::Ready,
    Status::Waiting,
    Status::Pending,
    Status::Success,
];

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Pending,
        Status::Waiting,
        Status::Ready,
        Status::Running,
        Status::Success,
        Status::Pass,
        Status::Failed,
        Status::Canceled,
        Status::Timeout,
        Status::Rejected,
    ];

    fn stage(self) -> Stage {
        match self {
            Self::Pending | Self::Waiting | Self::Ready => Stage::Queued,
            Self::Running => Stage::Running,
            _ => Stage::Terminal,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(self) -> bool {
        self.stage() == Stage::Terminal
    }

    /// Interrupt statuses stop the whole job.
    pub fn is_interrupt(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Canceled | Self::Timeout | Self::Rejected
        )
    }

    /// `Pass` is treated as `Success`.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::Pass)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Success => "success",
            Self::Pass => "pass",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
        }
    }

    fn fold_pass(self) -> Self {
        if self == Self::Pass {
            Self::Success
        } else {
            self
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StatusError::Unknown(s.to_string()))
    }
}

/// Reduce per-party statuses to one aggregate status.
///
/// Order-independent and idempotent. Uniform input returns that status (with
/// `Pass` folded to `Success`); otherwise the highest entry of the merge
/// priority wins, so any interrupt status beats everything else.
pub fn merge(statuses: &[Status]) -> Result<Status, StatusError> {
    let first = statuses.first().ok_or(StatusError::Empty)?.fold_pass();
    if statuses.iter().all(|s| s.fold_pass() == first) {
        return Ok(first);
    }
    MERGE_PRIORITY
        .iter()
        .copied()
        .find(|candidate| statuses.iter().any(|s| s.fold_pass() == *candidate))
        .ok_or_else(|| StatusError::Unmergeable(statuses.to_vec()))
}

/// Regular transition rule: the destination may never be earlier than the
/// current status, and terminal statuses are final.
pub fn allowed_transition(current: Status, next: Status) -> bool {
    if current == next {
        return true;
    }
    match (current.stage(), next.stage()) {
        (Stage::Queued, _) => true,
        (Stage::Running, Stage::Queued) => false,
        (Stage::Running, _) => true,
        (Stage::Terminal, _) => false,
    }
}

/// Transition rule for the given mode. Administrative writes may additionally
/// move a terminal status to an interrupt status (stop) or back to `Waiting`
/// (job rerun).
pub fn allowed_transition_with(current: Status, next: Status, mode: TransitionMode) -> bool {
    if allowed_transition(current, next) {
        return true;
    }
    mode == TransitionMode::Administrative
        && current.is_terminal()
        && (next.is_interrupt() || next == Status::Waiting)
}

/// Every status from which `next` may be written.
pub fn allowed_sources(next: Status, mode: TransitionMode) -> Vec<Status> {
    Status::ALL
        .into_iter()
        .filter(|current| allowed_transition_with(*current, next, mode))
        .collect()
}
