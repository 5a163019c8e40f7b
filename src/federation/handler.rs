//! Inbound side of the federation: decodes a command and applies it through
//! the [`PartyController`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::controller::PartyController;
use crate::error::{Error, JobError};
use crate::federation::client::CommandService;
use crate::federation::protocol::{
    Command, CreateJobBody, CreateTaskBody, FedRequest, FedResponse, PartyReply, RetCode,
    StatusBody, TaskStatusReport, to_body,
};
use crate::store::TaskKey;

/// Log the outcome of one outbound command.
pub fn log_reply(command: Command, request: &FedRequest, reply: &PartyReply) {
    if reply.is_success() {
        debug!(
            command = %command,
            job_id = %request.job_id,
            dest = %request.party(),
            "Federated command succeeded"
        );
    } else {
        warn!(
            command = %command,
            job_id = %request.job_id,
            dest = %request.party(),
            task_id = request.task_id.as_deref().unwrap_or("-"),
            reply = %reply.describe(),
            "Federated command failed"
        );
    }
}

/// Map an error to the code returned to the calling party.
pub fn ret_code(error: &Error) -> RetCode {
    match error {
        Error::Job(JobError::NotFound { .. } | JobError::TaskNotFound { .. }) => RetCode::NotFound,
        Error::Job(JobError::StaleVersion { .. }) => RetCode::IncompatibleVersion,
        _ => RetCode::OperatingError,
    }
}

pub struct CommandHandler {
    party: Arc<PartyController>,
}

impl CommandHandler {
    pub fn new(party: Arc<PartyController>) -> Self {
        Self { party }
    }

    async fn dispatch(&self, command: Command, request: &FedRequest) -> Result<FedResponse, Error> {
        let party = request.party();
        let job_id = request.job_id.as_str();

        let response = match command {
            Command::JobCreate => {
                let body: CreateJobBody = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                self.party.create_job(&party, job_id, body).await?;
                FedResponse::success()
            }
            Command::JobStart => {
                self.party.start_job(&party, job_id).await?;
                FedResponse::success()
            }
            Command::JobStop => {
                let body: StatusBody = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                self.party.stop_job(&party, job_id, body.status).await?;
                FedResponse::success()
            }
            Command::JobRerun => {
                self.party.rerun_job(&party, job_id).await?;
                FedResponse::success()
            }
            Command::JobSyncStatus => {
                let body: StatusBody = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                self.party.sync_job_status(&party, job_id, body.status).await?;
                FedResponse::success()
            }
            Command::JobClean => {
                self.party.clean_job(&party, job_id).await?;
                FedResponse::success()
            }
            Command::JobRequestStop => {
                let body: StatusBody = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                self.party
                    .mark_stop_requested(job_id, body.status, body.reason)
                    .await?;
                FedResponse::success()
            }
            Command::JobResourceApply => granted(self.party.apply_job_resource(&party, job_id).await?),
            Command::JobResourceReturn => {
                self.party.return_job_resource(&party, job_id).await?;
                FedResponse::success()
            }
            Command::TaskCreate => {
                let body: CreateTaskBody = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                let Some(version) = request.task_version else {
                    return Ok(missing_task());
                };
                self.party
                    .create_task(&party, job_id, &body.task_name, version, body.cause)
                    .await?;
                FedResponse::success()
            }
            Command::TaskStart
            | Command::TaskStop
            | Command::TaskCollect
            | Command::TaskReportStatus
            | Command::TaskSyncStatus
            | Command::TaskResourceApply
            | Command::TaskResourceReturn => {
                let Some(key) = task_key(request) else {
                    return Ok(missing_task());
                };
                self.dispatch_task(command, request, &key).await?
            }
        };
        Ok(response)
    }

    async fn dispatch_task(
        &self,
        command: Command,
        request: &FedRequest,
        key: &TaskKey,
    ) -> Result<FedResponse, Error> {
        Ok(match command {
            Command::TaskStart => {
                self.party.start_task(key).await?;
                FedResponse::success()
            }
            Command::TaskStop => {
                let body: StatusBody = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                self.party.stop_task(key, body.status).await?;
                FedResponse::success()
            }
            Command::TaskCollect => FedResponse::with_data(to_body(&self.party.collect(key).await?)),
            Command::TaskReportStatus => {
                let body: TaskStatusReport = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                self.party.report_status(key, body).await?;
                FedResponse::success()
            }
            Command::TaskSyncStatus => {
                let body: StatusBody = match decode(request) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                self.party.sync_task_status(key, body.status).await?;
                FedResponse::success()
            }
            Command::TaskResourceApply => granted(self.party.apply_task_resource(key).await?),
            Command::TaskResourceReturn => {
                self.party.return_task_resource(key).await?;
                FedResponse::success()
            }
            other => FedResponse::error(RetCode::OperatingError, format!("{other} is not a task command")),
        })
    }
}

#[async_trait]
impl CommandService for CommandHandler {
    async fn handle(&self, command: Command, request: FedRequest) -> FedResponse {
        debug!(
            command = %command,
            job_id = %request.job_id,
            party = %request.party(),
            src = %request.src_party_id,
            "Handling federated command"
        );
        match self.dispatch(command, &request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(command = %command, job_id = %request.job_id, error = %e, "Federated command failed locally");
                FedResponse::error(ret_code(&e), e.to_string())
            }
        }
    }
}

fn decode<T: DeserializeOwned>(request: &FedRequest) -> Result<T, FedResponse> {
    request
        .decode()
        .map_err(|e| FedResponse::error(RetCode::OperatingError, e))
}

fn task_key(request: &FedRequest) -> Option<TaskKey> {
    Some(TaskKey {
        task_id: request.task_id.clone()?,
        task_version: request.task_version?,
        role: request.role.clone(),
        party_id: request.party_id.clone(),
    })
}

fn missing_task() -> FedResponse {
    FedResponse::error(RetCode::OperatingError, "task_id and task_version are required")
}

fn granted(applied: bool) -> FedResponse {
    if applied {
        FedResponse::success()
    } else {
        FedResponse::error(RetCode::ResourceDenied, "insufficient resources")
    }
}
