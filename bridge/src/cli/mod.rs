//! Command implementations and output formatting for the `smartcache` binary.

pub mod commands;
pub mod error;
pub mod output;
