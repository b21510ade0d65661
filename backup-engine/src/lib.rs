//! Backup Engine Library
//!
//! Versioned backup sets on dumb remote storage: full and incremental
//! backups packed into size-capped volume pairs, rsync deltas against the
//! previous signatures, chain-aware restore and retention.

pub mod chain;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod destination;
pub mod events;
pub mod executor;
pub mod fs;
pub mod registry;
pub mod report;
pub mod sync;
pub mod transfer;
pub mod utils;
pub mod volume;

// Re-export commonly used types
pub use config::Config;
pub use controller::{Operation, OperationController, OperationOutput, TaskTicket};
pub use report::{Warning, WarningKind, WarningLog};
pub use utils::errors::{EngineError, IntegrityError, Result};
