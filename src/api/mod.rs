//! Client side of the remote function-management API.
//!
//! The orchestrator only ever talks to the API through [`FunctionApi`], so
//! batch runs can be driven against the HTTP client or an in-memory fake.

mod client;
mod error;
mod models;

pub use client::{ClientConfig, HttpFunctionApi, NAMESPACE_HEADER};
pub use error::{ApiError, is_retryable, is_retryable_status, status_code_of};
pub use models::{
    DesiredState, DesiredStateError, FunctionMetadata, FunctionPatch, FunctionRecord,
    FunctionSpec, FunctionState, FunctionStatus, GPU_RESOURCE_SUFFIX, PROJECT_NAME_LABEL,
    ResourceRequirements, Target,
};

use async_trait::async_trait;

use crate::types::{FunctionName, Namespace};

/// Operations the batch orchestrator needs from the platform.
#[async_trait]
pub trait FunctionApi: Send + Sync {
    /// List every function in a namespace, optionally narrowed by a label selector.
    async fn list_functions(
        &self,
        namespace: &Namespace,
        label_selector: Option<&str>,
    ) -> Result<Vec<FunctionRecord>, ApiError>;

    /// Fetch a single function, including its current status.
    async fn get_function(
        &self,
        namespace: &Namespace,
        name: &FunctionName,
    ) -> Result<FunctionRecord, ApiError>;

    /// Apply a partial state update. Success means "accepted", not "applied".
    async fn patch_function(
        &self,
        namespace: &Namespace,
        name: &FunctionName,
        patch: &FunctionPatch,
    ) -> Result<(), ApiError>;
}
