//! [`WorkflowClient`](crate::driver::WorkflowClient) implementations.

pub mod http;
pub mod local;

pub use http::HttpWorkflowClient;
pub use local::LocalWorkflowClient;
