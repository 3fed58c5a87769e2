//! CLI subcommand implementations.

pub mod attach;
pub mod destroy;
pub mod status;
