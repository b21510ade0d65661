//! Local filesystem access: source walking, filtering and metadata.

pub mod filter;
pub mod metadata;
pub mod walker;

pub use filter::PathFilter;
pub use metadata::FileMetadata;
pub use walker::{walk_source, FileInfo, WalkOutcome};
