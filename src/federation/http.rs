//! HTTP transport over reqwest.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::TransportError;
use crate::federation::client::Federation;
use crate::federation::protocol::{Command, FedRequest, FedResponse, PartyReply};
use crate::federation::retry::RetryPolicy;

/// Sends commands as JSON POSTs to each party's base URL.
pub struct HttpFederation {
    client: reqwest::Client,
    /// `party_id` → base URL, e.g. `http://10.0.0.2:9380`.
    peers: HashMap<String, String>,
    timeout: Duration,
    retry: RetryPolicy,
}

/// Failure of a single attempt.
enum Attempt {
    /// Connection or timeout; worth retrying.
    Transport(TransportError),
    /// The party answered with something that is not a reply.
    Decode(TransportError),
}

impl HttpFederation {
    pub fn new(
        peers: HashMap<String, String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable {
                party_id: String::new(),
                attempts: 0,
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            peers,
            timeout,
            retry,
        })
    }

    async fn post_once(&self, party_id: &str, url: &str, request: &FedRequest) -> Result<FedResponse, Attempt> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Attempt::Transport(TransportError::Timeout {
                        party_id: party_id.to_string(),
                        timeout: self.timeout,
                    })
                } else {
                    Attempt::Transport(TransportError::Unreachable {
                        party_id: party_id.to_string(),
                        attempts: 1,
                        reason: e.to_string(),
                    })
                }
            })?;

        let status = response.status();
        if status.is_server_error() && status != reqwest::StatusCode::INTERNAL_SERVER_ERROR {
            // Gateway errors and the like come from the path, not the party.
            return Err(Attempt::Transport(TransportError::Unreachable {
                party_id: party_id.to_string(),
                attempts: 1,
                reason: format!("HTTP {status}"),
            }));
        }

        response.json::<FedResponse>().await.map_err(|e| {
            Attempt::Decode(TransportError::Decode {
                party_id: party_id.to_string(),
                reason: format!("HTTP {status}: {e}"),
            })
        })
    }
}

#[async_trait]
impl Federation for HttpFederation {
    async fn send(&self, dest_party_id: &str, command: Command, request: &FedRequest) -> PartyReply {
        let Some(base) = self.peers.get(dest_party_id) else {
            return PartyReply::Unreachable(TransportError::UnknownPeer {
                party_id: dest_party_id.to_string(),
            });
        };
        let url = format!("{}{}", base.trim_end_matches('/'), command.path());
        debug!(url = %url, job_id = %request.job_id, "Sending federated command");

        // Decode failures are final; only transport failures are retried.
        let url = url.as_str();
        let result = self
            .retry
            .run(|| async move {
                match self.post_once(dest_party_id, url, request).await {
                    Ok(response) => Ok(Ok(response)),
                    Err(Attempt::Decode(e)) => Ok(Err(e)),
                    Err(Attempt::Transport(e)) => Err(e),
                }
            })
            .await;

        match result {
            Ok(Ok(response)) => PartyReply::Answered(response),
            Ok(Err(e)) => PartyReply::Unreachable(e),
            Err((e @ TransportError::Timeout { .. }, _)) => PartyReply::Unreachable(e),
            Err((e, attempts)) => PartyReply::Unreachable(TransportError::Unreachable {
                party_id: dest_party_id.to_string(),
                attempts,
                reason: e.to_string(),
            }),
        }
    }
}
