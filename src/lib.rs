//! fedflow: federated DAG job scheduling across parties.

pub mod config;
pub mod context;
pub mod controller;
pub mod dag;
pub mod detector;
pub mod engine;
pub mod error;
pub mod federation;
pub mod node;
pub mod resource;
pub mod scheduler;
pub mod status;
pub mod store;
