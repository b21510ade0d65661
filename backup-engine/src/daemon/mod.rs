//! Process-level plumbing for the command line runner.

pub mod shutdown;
