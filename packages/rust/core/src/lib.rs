//! Stage processing, drift monitoring and execution driving for ledgerflow.
//!
//! This crate ties the object store, the ledger and the external
//! collaborators together into the four pipeline stages, and drives workflow
//! executions that run them.

pub mod bridge;
pub mod context;
pub mod driver;
pub mod drift;
pub mod feed;
pub mod monitor;
pub mod predictions;
pub mod processor;
pub mod progress;
pub mod stages;
pub mod workflow;

pub use bridge::{BridgeCollaborator, BridgeConfig, Collaborator};
pub use context::PipelineContext;
pub use driver::{
    ExecutionDescription, ExecutionDriver, ExecutionHandle, ExecutionOutcome, ExecutionStatus,
    WorkflowClient, WorkflowHandle, WorkflowPage,
};
pub use feed::{FeedOptions, FeedReport, FeedRun, run_feed};
pub use monitor::run_monitor;
pub use predictions::{PredictionRow, PredictionTable, RawScores};
pub use processor::{RunOptions, StageReport, UnitTransform, run_stage};
pub use progress::{ProgressReporter, SilentProgress};
pub use stages::{PipelineReport, run_ingest, run_pipeline, run_score, run_transform};
pub use workflow::{HttpWorkflowClient, LocalWorkflowClient};
