//! # agentwall-cli
//!
//! Command-line interface for the AgentWall governance gateway.
//!
//! ## Commands
//!
//! - `agentwall serve` — Start the gateway
//! - `agentwall config show` — Print the resolved configuration
//! - `agentwall config validate` — Audit configuration for warnings
//! - `agentwall version` — Show version and build info

pub mod commands;

pub use commands::Cli;
