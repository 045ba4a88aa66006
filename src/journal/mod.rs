//! Journal: JSONL run history and BLAKE3 fingerprints of state files.

pub mod eventlog;
pub mod hasher;

pub use eventlog::Journal;
