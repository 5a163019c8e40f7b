//! Federated command protocol.
//!
//! Every command is a POST of a [`FedRequest`] to
//! `/v1/federation/{scope}/{action}` at the destination party, answered with a
//! [`FedResponse`]. Only `code == SUCCESS` counts as success when the replies
//! of a fan-out are aggregated.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dag::{DagSchema, PartyRef};
use crate::error::TransportError;
use crate::status::Status;
use crate::store::RerunCause;

/// Commands a party accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    JobCreate,
    JobStart,
    JobStop,
    JobRerun,
    JobSyncStatus,
    JobClean,
    /// Sent to the scheduling party: stop this job at the next pass.
    JobRequestStop,
    JobResourceApply,
    JobResourceReturn,
    TaskCreate,
    TaskStart,
    TaskStop,
    TaskCollect,
    /// Sent to the scheduling party: a party's status changed.
    TaskReportStatus,
    TaskSyncStatus,
    TaskResourceApply,
    TaskResourceReturn,
}

impl Command {
    pub const ALL: [Command; 17] = [
        Command::JobCreate,
        Command::JobStart,
        Command::JobStop,
        Command::JobRerun,
        Command::JobSyncStatus,
        Command::JobClean,
        Command::JobRequestStop,
        Command::JobResourceApply,
        Command::JobResourceReturn,
        Command::TaskCreate,
        Command::TaskStart,
        Command::TaskStop,
        Command::TaskCollect,
        Command::TaskReportStatus,
        Command::TaskSyncStatus,
        Command::TaskResourceApply,
        Command::TaskResourceReturn,
    ];

    pub fn scope(self) -> &'static str {
        match self {
            Self::JobCreate
            | Self::JobStart
            | Self::JobStop
            | Self::JobRerun
            | Self::JobSyncStatus
            | Self::JobClean
            | Self::JobRequestStop
            | Self::JobResourceApply
            | Self::JobResourceReturn => "job",
            _ => "task",
        }
    }

    pub fn action(self) -> &'static str {
        match self {
            Self::JobCreate | Self::TaskCreate => "create",
            Self::JobStart | Self::TaskStart => "start",
            Self::JobStop | Self::TaskStop => "stop",
            Self::JobRerun => "rerun",
            Self::JobSyncStatus | Self::TaskSyncStatus => "sync-status",
            Self::JobClean => "clean",
            Self::JobRequestStop => "request-stop",
            Self::JobResourceApply | Self::TaskResourceApply => "resource-apply",
            Self::JobResourceReturn | Self::TaskResourceReturn => "resource-return",
            Self::TaskCollect => "collect",
            Self::TaskReportStatus => "report-status",
        }
    }

    pub fn path(self) -> String {
        format!("/v1/federation/{}/{}", self.scope(), self.action())
    }

    pub fn from_parts(scope: &str, action: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.scope() == scope && c.action() == action)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope(), self.action())
    }
}

/// Transport-level return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetCode {
    Success,
    OperatingError,
    NotFound,
    ResourceDenied,
    IncompatibleVersion,
}

/// Envelope of every federated command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedRequest {
    pub job_id: String,
    /// Destination role.
    pub role: String,
    /// Destination party.
    pub party_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_version: Option<u32>,
    /// Party that sent the command.
    #[serde(default)]
    pub src_party_id: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl FedRequest {
    pub fn new(job_id: impl Into<String>, party: &PartyRef) -> Self {
        Self {
            job_id: job_id.into(),
            role: party.role.clone(),
            party_id: party.party_id.clone(),
            task_id: None,
            task_version: None,
            src_party_id: String::new(),
            body: serde_json::Value::Null,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>, task_version: u32) -> Self {
        self.task_id = Some(task_id.into());
        self.task_version = Some(task_version);
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn party(&self) -> PartyRef {
        PartyRef::new(self.role.clone(), self.party_id.clone())
    }

    /// Decode the body into a typed command payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(self.body.clone()).map_err(|e| format!("invalid body: {e}"))
    }
}

/// Reply of one party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedResponse {
    pub code: RetCode,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl FedResponse {
    pub fn success() -> Self {
        Self {
            code: RetCode::Success,
            message: "success".to_string(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Self::success()
        }
    }

    pub fn error(code: RetCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == RetCode::Success
    }
}

/// Outcome of one federated call to one party.
#[derive(Debug, Clone)]
pub enum PartyReply {
    Answered(FedResponse),
    /// Transport failure after retries.
    Unreachable(TransportError),
}

impl PartyReply {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Answered(r) if r.is_success())
    }

    pub fn code(&self) -> Option<RetCode> {
        match self {
            Self::Answered(r) => Some(r.code),
            Self::Unreachable(_) => None,
        }
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Answered(r) => Some(&r.data),
            Self::Unreachable(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Answered(r) => format!("{:?}: {}", r.code, r.message),
            Self::Unreachable(e) => e.to_string(),
        }
    }
}

/// Per-party replies of one fan-out.
#[derive(Debug, Clone, Default)]
pub struct FederatedResult {
    pub replies: Vec<(PartyRef, PartyReply)>,
}

impl FederatedResult {
    /// `Success` only when every party answered `Success`; otherwise the
    /// first failing code (`OperatingError` for unreachable parties).
    pub fn aggregate(&self) -> RetCode {
        self.replies
            .iter()
            .find(|(_, reply)| !reply.is_success())
            .map(|(_, reply)| reply.code().unwrap_or(RetCode::OperatingError))
            .unwrap_or(RetCode::Success)
    }

    pub fn is_success(&self) -> bool {
        self.aggregate() == RetCode::Success
    }

    pub fn succeeded(&self) -> Vec<PartyRef> {
        self.replies
            .iter()
            .filter(|(_, reply)| reply.is_success())
            .map(|(party, _)| party.clone())
            .collect()
    }

    pub fn failed(&self) -> Vec<PartyRef> {
        self.replies
            .iter()
            .filter(|(_, reply)| !reply.is_success())
            .map(|(party, _)| party.clone())
            .collect()
    }

    pub fn reply_of(&self, party: &PartyRef) -> Option<&PartyReply> {
        self.replies
            .iter()
            .find(|(p, _)| p == party)
            .map(|(_, reply)| reply)
    }

    /// One line per failed party, for error reports and logs.
    pub fn detail(&self) -> String {
        self.replies
            .iter()
            .filter(|(_, reply)| !reply.is_success())
            .map(|(party, reply)| format!("{party} {}", reply.describe()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ── Command bodies ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobBody {
    pub dag: DagSchema,
    pub initiator_party_id: String,
    pub scheduler_party_id: String,
}

/// Body of stop, sync-status and request-stop commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusBody {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskBody {
    pub task_name: String,
    #[serde(default)]
    pub cause: RerunCause,
}

/// Reply data of `task/collect` and body of `task/report-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub party_status: Status,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_report: Option<String>,
}

pub fn to_body<T: Serialize>(body: &T) -> serde_json::Value {
    serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_paths_round_trip() {
        for command in Command::ALL {
            let path = command.path();
            let mut parts = path.trim_start_matches("/v1/federation/").split('/');
            let scope = parts.next().unwrap();
            let action = parts.next().unwrap();
            assert_eq!(Command::from_parts(scope, action), Some(command));
        }
        assert_eq!(Command::TaskReportStatus.path(), "/v1/federation/task/report-status");
        assert_eq!(Command::from_parts("job", "collect"), None);
    }

    #[test]
    fn aggregate_requires_every_party() {
        let ok = PartyReply::Answered(FedResponse::success());
        let denied = PartyReply::Answered(FedResponse::error(RetCode::ResourceDenied, "no cores"));
        let gone = PartyReply::Unreachable(TransportError::UnknownPeer {
            party_id: "10000".into(),
        });
        let guest = PartyRef::new("guest", "9999");
        let host = PartyRef::new("host", "10000");

        let all_ok = FederatedResult {
            replies: vec![(guest.clone(), ok.clone()), (host.clone(), ok.clone())],
        };
        assert!(all_ok.is_success());

        let partial = FederatedResult {
            replies: vec![(guest.clone(), ok.clone()), (host.clone(), denied)],
        };
        assert_eq!(partial.aggregate(), RetCode::ResourceDenied);
        assert_eq!(partial.succeeded(), vec![guest.clone()]);
        assert_eq!(partial.failed(), vec![host.clone()]);
        assert!(partial.detail().contains("host:10000"));

        let unreachable = FederatedResult {
            replies: vec![(guest, ok), (host, gone)],
        };
        assert_eq!(unreachable.aggregate(), RetCode::OperatingError);
    }

    #[test]
    fn response_wire_format() {
        let raw = serde_json::to_value(FedResponse::error(RetCode::NotFound, "no job")).unwrap();
        assert_eq!(raw["code"], "NOT_FOUND");
        let parsed: FedResponse = serde_json::from_str(r#"{"code": "SUCCESS"}"#).unwrap();
        assert!(parsed.is_success());
    }
}
