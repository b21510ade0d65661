//! Progress accounting for long-running operations.

pub mod progress;
