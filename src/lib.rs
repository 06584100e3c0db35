//! # sandrun
//!
//! Sandboxed execution engine for untrusted, generated source snippets.
//!
//! ## Features
//!
//! - **Isolated units:** one disposable container per run, no network, no capabilities
//! - **Hard limits:** memory, CPU, process count and a wall-clock timeout with forced kill
//! - **Per-session workspaces:** persistent `code/`, `data/`, `output/` directories
//! - **Classified results:** syntax error, runtime exception, resource violation, infrastructure
//! - **Numeric verification:** output checked against π, e, the golden ratio and friends

pub mod config;
pub mod error;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, Result, ValidationError};
pub use sandbox::{
    ConstantTag, ExecutionId, ExecutionRequest, ExecutionResult, ExecutionStatus, SandboxEngine,
};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
