//! sandbox-runner library
//!
//! Sandboxed execution of untrusted Python, C++ and Go code:
//! - Process execution with timeouts and partial output capture
//! - Per-execution workspaces, removed on drop
//! - Docker CLI command construction with CPU/memory limits and no network
//! - Language runners and the MCP server that exposes them

pub mod config;
pub mod executor;
pub mod limits;
pub mod mcp;
pub mod runner;
pub mod sandbox;
pub mod workspace;
