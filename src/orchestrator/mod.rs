//! Batch redeploy orchestration.
//!
//! Resolves the target set (from the namespace listing, explicit names, or
//! the retryable failures of a previous report), filters exclusions, fans the
//! remaining functions out through a [`BoundedExecutor`], and records every
//! outcome in a shared [`Ledger`].

#[cfg(test)]
mod integration_tests;
mod patch;
mod target_filter;

pub use patch::{
    DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT, PatchError, WaitOptions, WaitState,
    patch_function, wait_for_state,
};
pub use target_filter::{SkipReason, TargetFilter};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{DesiredState, FunctionApi, Target, is_retryable_status};
use crate::core::{BoundedExecutor, TaskError};
use crate::ledger::Ledger;
use crate::types::{FunctionName, Namespace};

/// Default number of functions patched at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Everything a batch run needs to know.
#[derive(Debug, Clone)]
pub struct RedeployOptions {
    pub namespace: Namespace,
    /// Explicitly named functions. Empty means "every function" unless
    /// resuming from a report.
    pub functions: Vec<FunctionName>,
    /// Previous report whose retryable failures are added to the target set.
    pub from_report: Option<PathBuf>,
    /// Where to save this run's report.
    pub report_path: Option<PathBuf>,
    /// Save the report after every recorded outcome, not only at the end.
    pub checkpoint: bool,
    pub filter: TargetFilter,
    pub label_selector: Option<String>,
    /// Maximum functions in flight; 0 means unbounded.
    pub concurrency: usize,
    pub desired_state: DesiredState,
    pub wait: Option<WaitOptions>,
}

impl RedeployOptions {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            functions: Vec::new(),
            from_report: None,
            report_path: None,
            checkpoint: false,
            filter: TargetFilter::allow_all(),
            label_selector: None,
            concurrency: DEFAULT_CONCURRENCY,
            desired_state: DesiredState::Ready,
            wait: None,
        }
    }
}

/// Drives batch redeploys against a [`FunctionApi`].
pub struct Redeployer {
    api: Arc<dyn FunctionApi>,
}

impl Redeployer {
    pub fn new(api: Arc<dyn FunctionApi>) -> Self {
        Self { api }
    }

    /// Run a batch. Only setup failures (report loading, function listing)
    /// are returned as errors; per-function failures end up in the ledger.
    pub async fn run(
        &self,
        options: &RedeployOptions,
        cancel: CancellationToken,
    ) -> Result<Arc<Ledger>> {
        let ledger = Arc::new(Ledger::new());

        let requested = requested_names(options).await?;
        if requested.as_ref().is_some_and(|names| names.is_empty()) {
            info!("No functions to redeploy");
            self.finish(&ledger, options).await;
            return Ok(ledger);
        }

        let listed = self
            .resolve_targets(&options.namespace, options.label_selector.as_deref())
            .await?;
        let (candidates, missing) = select_targets(listed, requested.as_deref());

        for name in missing {
            warn!(function = %name, namespace = %options.namespace, "Function not found");
            ledger
                .add_failure(
                    &name,
                    "function not found in namespace",
                    is_retryable_status(Some(StatusCode::NOT_FOUND)),
                )
                .await;
        }

        let (keep, skipped) = options.filter.partition(candidates);
        for (target, reason) in skipped {
            info!(function = %target.name, reason = %reason, "Skipping function");
            ledger.add_skipped(&target.name).await;
        }

        info!(
            count = keep.len(),
            concurrency = options.concurrency,
            desired_state = %options.desired_state,
            wait = options.wait.is_some(),
            "Redeploying functions"
        );
        self.dispatch(keep, options, &ledger, cancel).await;
        self.finish(&ledger, options).await;

        Ok(ledger)
    }

    /// List every function in the namespace as a batch target.
    pub async fn resolve_targets(
        &self,
        namespace: &Namespace,
        label_selector: Option<&str>,
    ) -> Result<Vec<Target>> {
        let records = self
            .api
            .list_functions(namespace, label_selector)
            .await
            .with_context(|| format!("Failed to list functions in namespace {}", namespace))?;

        Ok(records
            .iter()
            .map(|record| Target::from_record(record, namespace))
            .collect())
    }

    async fn dispatch(
        &self,
        targets: Vec<Target>,
        options: &RedeployOptions,
        ledger: &Arc<Ledger>,
        cancel: CancellationToken,
    ) {
        let mut executor = BoundedExecutor::new(options.concurrency, cancel.clone());
        let checkpoint_path = options
            .report_path
            .clone()
            .filter(|_| options.checkpoint);

        for target in targets {
            let api = self.api.clone();
            let ledger = ledger.clone();
            let cancel = cancel.clone();
            let checkpoint_path = checkpoint_path.clone();
            let desired = options.desired_state;
            let wait = options.wait;

            executor.spawn(target.name.to_string(), move || async move {
                let result = patch_function(api.as_ref(), &target, desired, wait, &cancel).await;
                match &result {
                    Ok(()) => {
                        info!(function = %target.name, "Function redeployed");
                        ledger.add_success(&target.name).await;
                    }
                    Err(err) => {
                        let retryable = err.is_retryable();
                        warn!(
                            function = %target.name,
                            retryable,
                            error = %err,
                            "Function redeploy failed"
                        );
                        ledger.add_failure(&target.name, err, retryable).await;
                    }
                }

                if let Some(path) = checkpoint_path {
                    if let Err(err) = ledger.save_to_file(&path).await {
                        warn!(error = %err, "Failed to checkpoint report");
                    }
                }

                result.with_context(|| format!("redeploying {}", target.name))
            });
        }

        if let Err(err) = executor.wait().await {
            for failure in &err.failures {
                // Failed bodies already recorded themselves.
                if matches!(failure.error, TaskError::Failed(_)) {
                    continue;
                }
                let name = FunctionName::new(failure.name.clone());
                ledger.add_failure_if_absent(&name, &failure.error, true).await;
            }
            warn!(failed = err.failures.len(), "Some functions were not redeployed");
        }
    }

    async fn finish(&self, ledger: &Ledger, options: &RedeployOptions) {
        ledger.log_summary().await;

        if let Some(path) = &options.report_path {
            match ledger.save_to_file(path).await {
                Ok(()) => info!(path = %path.display(), "Saved redeploy report"),
                Err(err) => error!(error = %err, "Failed to save redeploy report"),
            }
        }
    }
}

/// Names to process, or `None` for "every function in the namespace".
async fn requested_names(options: &RedeployOptions) -> Result<Option<Vec<FunctionName>>> {
    match &options.from_report {
        Some(path) => {
            let prior = Ledger::load_from_file(path)
                .await
                .with_context(|| format!("Failed to resume from {}", path.display()))?;
            let retryable = prior.get_retryable_names().await;
            info!(
                path = %path.display(),
                retryable = retryable.len(),
                "Resuming from report"
            );
            Ok(Some(resume_names(&options.functions, &retryable)))
        }
        None if options.functions.is_empty() => Ok(None),
        None => Ok(Some(resume_names(&options.functions, &[]))),
    }
}

/// De-duplicated union of explicit names and a previous run's retryable
/// failures, explicit names first.
pub fn resume_names(explicit: &[FunctionName], retryable: &[FunctionName]) -> Vec<FunctionName> {
    let mut seen = HashSet::new();
    explicit
        .iter()
        .chain(retryable.iter())
        .filter(|name| seen.insert(*name))
        .cloned()
        .collect()
}

/// Pick requested targets out of a listing. Returns the selected targets and
/// the requested names that were not listed.
pub fn select_targets(
    listed: Vec<Target>,
    requested: Option<&[FunctionName]>,
) -> (Vec<Target>, Vec<FunctionName>) {
    let Some(requested) = requested else {
        return (listed, Vec::new());
    };

    let mut by_name: std::collections::HashMap<FunctionName, Target> = listed
        .into_iter()
        .map(|target| (target.name.clone(), target))
        .collect();

    let mut selected = Vec::with_capacity(requested.len());
    let mut missing = Vec::new();
    for name in requested {
        match by_name.remove(name) {
            Some(target) => selected.push(target),
            None => missing.push(name.clone()),
        }
    }

    (selected, missing)
}
