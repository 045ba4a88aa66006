//! Core workflows: configuration, retries, bootstrap, provisioning, teardown, state hygiene.

pub mod bootstrap;
pub mod cleanup;
pub mod error;
pub mod hygiene;
pub mod keys;
pub mod metadata;
pub mod parser;
pub mod provision;
pub mod retry;
pub mod teardown;
pub mod types;
