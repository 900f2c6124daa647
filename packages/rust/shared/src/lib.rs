//! Shared types, error model, and configuration for ledgerflow.
//!
//! This crate is the foundation depended on by all other ledgerflow crates.
//! It provides:
//! - [`LedgerflowError`]: the unified error type and its [`ErrorKind`] taxonomy
//! - Domain types ([`LedgerRecord`], [`MetricsRecord`], [`Stage`], [`RunId`])
//! - Configuration ([`AppConfig`], [`PollPolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, CollaboratorsConfig, DriftMethod, DriverConfig, IngestConfig,
    LedgerConfig, MonitorConfig, ObjectsConfig, PollPolicy, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_config,
};
pub use error::{ErrorKind, ErrorPayload, LedgerflowError, Result, UnitFailure};
pub use types::{LedgerRecord, MetricsRecord, RunId, Stage, StageOutputs};
