//! HTTP client for per-session runner processes.

mod client;
mod error;

pub use client::{
    DEFAULT_URL_TEMPLATE, RunnerClient, RunnerConfig, default_capabilities, default_mcp_status,
};
pub use error::{RunnerError, RunnerResult, is_unresolvable};
