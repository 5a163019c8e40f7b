//! Resource accounting: the party-local [`ResourceLedger`] and the
//! federated [`ResourceManager`] that applies across all parties of a job.

pub mod ledger;
pub mod manager;

pub use ledger::ResourceLedger;
pub use manager::ResourceManager;
