//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;
pub mod units;

pub use errors::{EngineError, IntegrityError, Result};
