//! Stackhand: bootstrap, apply and tear down Terraform-managed AWS stacks.
//!
//! Idempotent S3 state bootstrap. Bounded retries around every cloud call.
//! Teardown that falls back to tag-based cleanup when Terraform cannot finish.

pub mod cli;
pub mod console;
pub mod core;
pub mod engine;
pub mod journal;
pub mod provider;
pub mod transport;

#[cfg(test)]
mod testing;
