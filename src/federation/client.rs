//! Outbound side of the federation: the [`Federation`] transport trait and
//! the [`FederatedClient`] that fans commands out to parties.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::debug;

use crate::dag::PartyRef;
use crate::error::TransportError;
use crate::federation::handler::log_reply;
use crate::federation::protocol::{Command, FedRequest, FedResponse, FederatedResult, PartyReply};

/// Delivers one command to one party.
///
/// Implementations retry transport failures themselves; application codes in
/// an answered [`FedResponse`] are final.
#[async_trait]
pub trait Federation: Send + Sync {
    async fn send(&self, dest_party_id: &str, command: Command, request: &FedRequest) -> PartyReply;
}

/// Inbound side of a party, as seen by an in-process transport.
#[async_trait]
pub trait CommandService: Send + Sync {
    async fn handle(&self, command: Command, request: FedRequest) -> FedResponse;
}

/// Fans commands out over a [`Federation`] transport.
#[derive(Clone)]
pub struct FederatedClient {
    local_party_id: String,
    transport: Arc<dyn Federation>,
}

impl FederatedClient {
    pub fn new(local_party_id: impl Into<String>, transport: Arc<dyn Federation>) -> Self {
        Self {
            local_party_id: local_party_id.into(),
            transport,
        }
    }

    pub fn local_party_id(&self) -> &str {
        &self.local_party_id
    }

    /// Send one command to every party concurrently and wait for all replies.
    /// `prepare` fills the task fields and body of each party's request.
    pub async fn send_to_parties<F>(
        &self,
        command: Command,
        job_id: &str,
        parties: &[PartyRef],
        prepare: F,
    ) -> FederatedResult
    where
        F: Fn(FedRequest) -> FedRequest,
    {
        let requests: Vec<(PartyRef, FedRequest)> = parties
            .iter()
            .map(|party| {
                let mut request = prepare(FedRequest::new(job_id, party));
                request.src_party_id = self.local_party_id.clone();
                (party.clone(), request)
            })
            .collect();

        let sends = requests.iter().map(|(party, request)| async move {
            let reply = self
                .transport
                .send(&party.party_id, command, request)
                .await;
            log_reply(command, request, &reply);
            (party.clone(), reply)
        });
        let replies = join_all(sends).await;
        debug!(job_id, command = %command, parties = parties.len(), "Federated call finished");
        FederatedResult { replies }
    }

    /// Send one command to the scheduling party of a job.
    pub async fn send_to_scheduler(
        &self,
        scheduler_party_id: &str,
        command: Command,
        mut request: FedRequest,
    ) -> PartyReply {
        request.src_party_id = self.local_party_id.clone();
        let reply = self
            .transport
            .send(scheduler_party_id, command, &request)
            .await;
        log_reply(command, &request, &reply);
        reply
    }
}

/// In-process transport: delivers commands straight to registered parties.
///
/// Holds weak references, so parties that hold a client over this transport
/// do not keep each other alive.
#[derive(Default)]
pub struct LoopbackFederation {
    parties: RwLock<HashMap<String, Weak<dyn CommandService>>>,
    /// Parties whose traffic is dropped, simulating a partition.
    partitioned: RwLock<Vec<String>>,
}

impl LoopbackFederation {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, party_id: impl Into<String>, service: &Arc<dyn CommandService>) {
        self.parties
            .write()
            .await
            .insert(party_id.into(), Arc::downgrade(service));
    }

    /// Drop all traffic to `party_id` until [`heal`](Self::heal).
    pub async fn partition(&self, party_id: impl Into<String>) {
        self.partitioned.write().await.push(party_id.into());
    }

    pub async fn heal(&self, party_id: &str) {
        self.partitioned.write().await.retain(|p| p != party_id);
    }
}

#[async_trait]
impl Federation for LoopbackFederation {
    async fn send(&self, dest_party_id: &str, command: Command, request: &FedRequest) -> PartyReply {
        if self.partitioned.read().await.iter().any(|p| p == dest_party_id) {
            return PartyReply::Unreachable(TransportError::Unreachable {
                party_id: dest_party_id.to_string(),
                attempts: 1,
                reason: "partitioned".to_string(),
            });
        }
        let service = self
            .parties
            .read()
            .await
            .get(dest_party_id)
            .and_then(Weak::upgrade);
        match service {
            Some(service) => PartyReply::Answered(service.handle(command, request.clone()).await),
            None => PartyReply::Unreachable(TransportError::UnknownPeer {
                party_id: dest_party_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::protocol::RetCode;

    /// Answers `create` for known jobs and denies everything else.
    struct Echo;

    #[async_trait]
    impl CommandService for Echo {
        async fn handle(&self, command: Command, request: FedRequest) -> FedResponse {
            match command {
                Command::JobCreate => FedResponse::with_data(serde_json::json!({
                    "party": request.party_id,
                    "src": request.src_party_id,
                })),
                _ => FedResponse::error(RetCode::ResourceDenied, "denied"),
            }
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_party() {
        let loopback = Arc::new(LoopbackFederation::new());
        let echo: Arc<dyn CommandService> = Arc::new(Echo);
        loopback.register("9999", &echo).await;
        loopback.register("10000", &echo).await;

        let client = FederatedClient::new("9999", loopback.clone());
        let parties = vec![PartyRef::new("guest", "9999"), PartyRef::new("host", "10000")];
        let result = client
            .send_to_parties(Command::JobCreate, "j1", &parties, |r| r)
            .await;
        assert!(result.is_success());
        let data = result.reply_of(&parties[1]).unwrap().data().unwrap();
        assert_eq!(data["party"], "10000");
        assert_eq!(data["src"], "9999");

        let denied = client
            .send_to_parties(Command::JobStart, "j1", &parties, |r| r)
            .await;
        assert_eq!(denied.aggregate(), RetCode::ResourceDenied);
    }

    #[tokio::test]
    async fn unknown_and_partitioned_parties_are_unreachable() {
        let loopback = Arc::new(LoopbackFederation::new());
        let echo: Arc<dyn CommandService> = Arc::new(Echo);
        loopback.register("9999", &echo).await;
        let client = FederatedClient::new("9999", loopback.clone());

        let reply = client
            .send_to_scheduler("12345", Command::JobCreate, FedRequest::new("j1", &PartyRef::new("guest", "12345")))
            .await;
        assert!(matches!(reply, PartyReply::Unreachable(TransportError::UnknownPeer { .. })));

        loopback.partition("9999").await;
        let guest = PartyRef::new("guest", "9999");
        let reply = client
            .send_to_scheduler("9999", Command::JobCreate, FedRequest::new("j1", &guest))
            .await;
        assert!(!reply.is_success());
        loopback.heal("9999").await;
        let reply = client
            .send_to_scheduler("9999", Command::JobCreate, FedRequest::new("j1", &guest))
            .await;
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn dropped_party_is_unreachable() {
        let loopback = Arc::new(LoopbackFederation::new());
        {
            let echo: Arc<dyn CommandService> = Arc::new(Echo);
            loopback.register("9999", &echo).await;
        }
        let guest = PartyRef::new("guest", "9999");
        let reply = loopback
            .send("9999", Command::JobCreate, &FedRequest::new("j1", &guest))
            .await;
        assert!(!reply.is_success());
    }
}
