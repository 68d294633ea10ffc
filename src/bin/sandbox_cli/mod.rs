//! CLI subcommand implementations for shadow-sandbox

pub mod config;
pub mod resolve;
pub mod runs;
