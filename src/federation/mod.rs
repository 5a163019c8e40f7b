//! Cross-party command plumbing: wire protocol, transports, inbound handler
//! and HTTP routes.

pub mod client;
pub mod handler;
pub mod http;
pub mod protocol;
pub mod retry;
pub mod routes;

pub use client::{CommandService, FederatedClient, Federation, LoopbackFederation};
pub use handler::CommandHandler;
pub use http::HttpFederation;
pub use protocol::{
    Command, CreateJobBody, CreateTaskBody, FedRequest, FedResponse, FederatedResult, PartyReply,
    RetCode, StatusBody, TaskStatusReport,
};
pub use retry::RetryPolicy;
