// Core modules
pub mod api;
pub mod config;
pub mod core;
pub mod ledger;
pub mod orchestrator;
pub mod types;

// Re-export key types and functions
pub use api::{ClientConfig, DesiredState, FunctionApi, HttpFunctionApi, Target};
pub use config::{FileConfig, Overrides, Settings};
pub use crate::core::BoundedExecutor;
pub use ledger::{Ledger, LedgerSnapshot, Outcome};
pub use orchestrator::{PatchError, RedeployOptions, Redeployer, TargetFilter, WaitOptions};
pub use types::{FunctionName, Namespace, ProjectName};

use std::sync::Arc;
use anyhow::Result;

/// Convenience function to create a redeployer talking to the HTTP API.
pub fn create_redeployer(settings: &Settings) -> Result<Redeployer> {
    let api = HttpFunctionApi::new(&settings.client)?;
    Ok(Redeployer::new(Arc::new(api)))
}
