//! Core types for the kernel agent.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (KernelId, SessionId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for paths, proxy, and backends

mod config;
mod errors;
mod ids;

pub use config::{
    AgentConfig, Config, ContainerConfig, DummyConfig, LimitsConfig, LogFormat, LoggingConfig,
    OrchestratorConfig, ProxyConfig,
};
pub use errors::{Error, Result};
pub use ids::{AgentId, ContainerId, KernelId, SessionId};
