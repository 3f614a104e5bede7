//! Scenario tests for batch redeploys.
//!
//! These drive [`Redeployer`] end to end against an in-memory
//! [`FunctionApi`] that scripts patch results and status sequences and
//! counts every remote call.

#![cfg(test)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{Redeployer, RedeployOptions, TargetFilter, WaitOptions};
use crate::api::{
    ApiError, FunctionApi, FunctionMetadata, FunctionPatch, FunctionRecord, FunctionState,
    FunctionStatus, PROJECT_NAME_LABEL,
};
use crate::ledger::{Ledger, Outcome};
use crate::types::{FunctionName, Namespace};

/// One scripted answer to a status fetch.
#[derive(Debug, Clone)]
pub(crate) enum ScriptedStatus {
    State(FunctionState),
    Fail(StatusCode),
}

#[derive(Debug, Clone)]
enum PatchBehavior {
    Status(StatusCode),
    Transport,
    Panic,
}

#[derive(Debug, Default)]
struct FakeFunction {
    record: FunctionRecord,
    patch_behavior: Option<PatchBehavior>,
    statuses: VecDeque<ScriptedStatus>,
    last_status: Option<ScriptedStatus>,
}

/// In-memory function-management API.
#[derive(Default)]
pub(crate) struct FakeApi {
    functions: Mutex<BTreeMap<String, FakeFunction>>,
    list_failure: Option<StatusCode>,
    patch_delay: Duration,
    list_calls: AtomicUsize,
    patch_calls: Mutex<HashMap<String, usize>>,
    get_calls: Mutex<HashMap<String, usize>>,
    active_patches: AtomicUsize,
    peak_patches: AtomicUsize,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_function(self, name: &str, project: Option<&str>, gpu: bool) -> Self {
        let mut record = FunctionRecord {
            metadata: FunctionMetadata {
                name: name.to_string(),
                namespace: "default".to_string(),
                labels: BTreeMap::new(),
            },
            status: FunctionStatus {
                state: FunctionState::Ready,
                message: None,
            },
            ..Default::default()
        };
        if let Some(project) = project {
            record
                .metadata
                .labels
                .insert(PROJECT_NAME_LABEL.to_string(), project.to_string());
        }
        if gpu {
            record
                .spec
                .resources
                .limits
                .insert("nvidia.com/gpu".to_string(), serde_json::json!("1"));
        }

        self.functions.lock().unwrap().insert(
            name.to_string(),
            FakeFunction {
                record,
                ..Default::default()
            },
        );
        self
    }

    pub(crate) fn with_state(self, name: &str, state: FunctionState) -> Self {
        self.update(name, |f| f.record.status.state = state);
        self
    }

    pub(crate) fn with_statuses(self, name: &str, statuses: Vec<ScriptedStatus>) -> Self {
        self.update(name, |f| f.statuses = statuses.into());
        self
    }

    pub(crate) fn with_patch_failure(self, name: &str, status: StatusCode) -> Self {
        self.update(name, |f| f.patch_behavior = Some(PatchBehavior::Status(status)));
        self
    }

    pub(crate) fn with_patch_transport_failure(self, name: &str) -> Self {
        self.update(name, |f| f.patch_behavior = Some(PatchBehavior::Transport));
        self
    }

    pub(crate) fn with_patch_panic(self, name: &str) -> Self {
        self.update(name, |f| f.patch_behavior = Some(PatchBehavior::Panic));
        self
    }

    pub(crate) fn with_patch_delay(mut self, delay: Duration) -> Self {
        self.patch_delay = delay;
        self
    }

    pub(crate) fn with_list_failure(mut self, status: StatusCode) -> Self {
        self.list_failure = Some(status);
        self
    }

    /// Clear a scripted patch failure, as if the cause went away.
    pub(crate) fn heal(&self, name: &str) {
        self.update(name, |f| f.patch_behavior = None);
    }

    fn update(&self, name: &str, change: impl FnOnce(&mut FakeFunction)) {
        let mut functions = self.functions.lock().unwrap();
        let function = functions.get_mut(name).expect("unknown fake function");
        change(function);
    }

    pub(crate) fn patch_calls(&self, name: &str) -> usize {
        self.patch_calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn total_patch_calls(&self) -> usize {
        self.patch_calls.lock().unwrap().values().sum()
    }

    pub(crate) fn get_calls(&self, name: &str) -> usize {
        self.get_calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_patches(&self) -> usize {
        self.peak_patches.load(Ordering::SeqCst)
    }
}

fn count(calls: &Mutex<HashMap<String, usize>>, name: &FunctionName) {
    *calls
        .lock()
        .unwrap()
        .entry(name.as_str().to_string())
        .or_default() += 1;
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: StatusCode::NOT_FOUND,
        body: String::new(),
    }
}

#[async_trait]
impl FunctionApi for FakeApi {
    async fn list_functions(
        &self,
        _namespace: &Namespace,
        _label_selector: Option<&str>,
    ) -> Result<Vec<FunctionRecord>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.list_failure {
            return Err(ApiError::Status {
                status,
                body: "listing unavailable".to_string(),
            });
        }
        let functions = self.functions.lock().unwrap();
        Ok(functions.values().map(|f| f.record.clone()).collect())
    }

    async fn get_function(
        &self,
        _namespace: &Namespace,
        name: &FunctionName,
    ) -> Result<FunctionRecord, ApiError> {
        count(&self.get_calls, name);

        let mut functions = self.functions.lock().unwrap();
        let function = functions.get_mut(name.as_str()).ok_or_else(not_found)?;

        let scripted = match function.statuses.pop_front() {
            Some(next) => {
                function.last_status = Some(next.clone());
                Some(next)
            }
            None => function.last_status.clone(),
        };

        match scripted {
            Some(ScriptedStatus::Fail(status)) => Err(ApiError::Status {
                status,
                body: String::new(),
            }),
            Some(ScriptedStatus::State(state)) => {
                let mut record = function.record.clone();
                record.status.state = state;
                Ok(record)
            }
            None => Ok(function.record.clone()),
        }
    }

    async fn patch_function(
        &self,
        _namespace: &Namespace,
        name: &FunctionName,
        _patch: &FunctionPatch,
    ) -> Result<(), ApiError> {
        count(&self.patch_calls, name);

        let behavior = {
            let functions = self.functions.lock().unwrap();
            let function = functions.get(name.as_str()).ok_or_else(not_found)?;
            function.patch_behavior.clone()
        };

        let active = self.active_patches.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_patches.fetch_max(active, Ordering::SeqCst);
        if !self.patch_delay.is_zero() {
            tokio::time::sleep(self.patch_delay).await;
        }
        self.active_patches.fetch_sub(1, Ordering::SeqCst);

        match behavior {
            None => Ok(()),
            Some(PatchBehavior::Status(status)) => Err(ApiError::Status {
                status,
                body: "rejected".to_string(),
            }),
            Some(PatchBehavior::Transport) => {
                Err(ApiError::Transport("operation timed out".to_string()))
            }
            Some(PatchBehavior::Panic) => panic!("patch handler crashed for {}", name),
        }
    }
}

fn options() -> RedeployOptions {
    RedeployOptions::new(Namespace::new("default"))
}

fn names(list: &[&str]) -> Vec<FunctionName> {
    list.iter().map(|n| FunctionName::new(*n)).collect()
}

fn fast_wait(timeout_ms: u64) -> Option<WaitOptions> {
    Some(WaitOptions {
        timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(10),
    })
}

async fn run(api: &Arc<FakeApi>, options: &RedeployOptions) -> Arc<Ledger> {
    Redeployer::new(api.clone())
        .run(options, CancellationToken::new())
        .await
        .unwrap()
}

async fn failure(ledger: &Ledger, name: &str) -> (String, bool) {
    match ledger.outcome(&FunctionName::new(name)).await {
        Some(Outcome::Failed { message, retryable }) => (message, retryable),
        other => panic!("expected {} to have failed, got {:?}", name, other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basic_batch() {
    let mut api = FakeApi::new().with_patch_delay(Duration::from_millis(20));
    for name in ["a", "b", "c", "d", "e"] {
        api = api.with_function(name, Some("web"), false);
    }
    let api = Arc::new(api);

    let mut opts = options();
    opts.concurrency = 2;
    let ledger = run(&api, &opts).await;

    let snapshot = ledger.snapshot().await;
    assert_eq!(snapshot.success.len(), 5);
    assert!(snapshot.skipped.is_empty());
    assert!(snapshot.failed.is_empty());
    assert!(api.peak_patches() <= 2);
    assert_eq!(api.total_patch_calls(), 5);
}

#[tokio::test]
async fn test_mixed_outcomes_and_resume() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("a", None, false)
            .with_function("b", None, false)
            .with_function("c", None, false)
            .with_patch_failure("b", StatusCode::PRECONDITION_FAILED)
            .with_patch_transport_failure("c"),
    );
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");

    let mut opts = options();
    opts.report_path = Some(report.clone());
    let ledger = run(&api, &opts).await;

    let snapshot = ledger.snapshot().await;
    assert_eq!(snapshot.success, names(&["a"]));
    assert_eq!(snapshot.failed.len(), 2);
    assert!(!failure(&ledger, "b").await.1);
    assert!(failure(&ledger, "c").await.1);

    let saved = Ledger::load_from_file(&report).await.unwrap();
    assert_eq!(saved.get_retryable_names().await, names(&["c"]));

    // The resumed run only ever touches the retryable failure.
    api.heal("c");
    let mut resume = options();
    resume.from_report = Some(report.clone());
    let resumed = run(&api, &resume).await;

    assert_eq!(api.patch_calls("a"), 1);
    assert_eq!(api.patch_calls("b"), 1);
    assert_eq!(api.patch_calls("c"), 2);
    let snapshot = resumed.snapshot().await;
    assert_eq!(snapshot.success, names(&["c"]));
    assert!(snapshot.failed.is_empty());
}

#[tokio::test]
async fn test_resume_merges_explicit_names() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("a", None, false)
            .with_function("b", None, false)
            .with_function("c", None, false),
    );
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");

    let prior = Ledger::new();
    prior.add_success(&FunctionName::new("a")).await;
    prior.add_failure(&FunctionName::new("b"), "timed out", true).await;
    prior.add_failure(&FunctionName::new("c"), "precondition failed", false).await;
    prior.save_to_file(&report).await.unwrap();

    let mut opts = options();
    opts.from_report = Some(report);
    opts.functions = names(&["b", "a"]);
    let ledger = run(&api, &opts).await;

    // "a" is named explicitly so it runs again; "c" is neither named nor retryable.
    assert_eq!(api.patch_calls("a"), 1);
    assert_eq!(api.patch_calls("b"), 1);
    assert_eq!(api.patch_calls("c"), 0);
    assert_eq!(ledger.len().await, 2);
}

#[tokio::test]
async fn test_resume_with_nothing_retryable_does_nothing() {
    let api = Arc::new(FakeApi::new().with_function("a", None, false));
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");

    let prior = Ledger::new();
    prior.add_success(&FunctionName::new("a")).await;
    prior.save_to_file(&report).await.unwrap();

    let mut opts = options();
    opts.from_report = Some(report);
    let ledger = run(&api, &opts).await;

    assert_eq!(ledger.len().await, 0);
    assert_eq!(api.list_calls(), 0);
    assert_eq!(api.total_patch_calls(), 0);
}

#[tokio::test]
async fn test_resume_from_missing_report_fails_before_any_call() {
    let api = Arc::new(FakeApi::new().with_function("a", None, false));
    let dir = TempDir::new().unwrap();

    let mut opts = options();
    opts.from_report = Some(dir.path().join("missing.json"));
    let result = Redeployer::new(api.clone())
        .run(&opts, CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(api.list_calls(), 0);
    assert_eq!(api.total_patch_calls(), 0);
}

#[tokio::test]
async fn test_listing_failure_aborts_run() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("a", None, false)
            .with_list_failure(StatusCode::SERVICE_UNAVAILABLE),
    );

    let result = Redeployer::new(api.clone())
        .run(&options(), CancellationToken::new())
        .await;

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("listing unavailable"));
    assert_eq!(api.total_patch_calls(), 0);
}

#[tokio::test]
async fn test_skip_filtering() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("a", Some("web"), false)
            .with_function("b", Some("web"), false)
            .with_function("c", Some("legacy"), false)
            .with_function("d", Some("web"), false),
    );

    let mut opts = options();
    opts.filter = TargetFilter::allow_all().exclude_projects(["legacy"]);
    let ledger = run(&api, &opts).await;

    let snapshot = ledger.snapshot().await;
    assert_eq!(snapshot.success.len(), 3);
    assert_eq!(snapshot.skipped, names(&["c"]));
    assert_eq!(api.patch_calls("c"), 0);
    assert_eq!(api.get_calls("c"), 0);
}

#[tokio::test]
async fn test_gpu_and_imported_filters() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("train", None, true)
            .with_function("legacy", None, false)
            .with_function("fresh", None, false)
            .with_state("legacy", FunctionState::Imported)
            .with_state("fresh", FunctionState::Ready),
    );

    let mut opts = options();
    opts.filter = TargetFilter::allow_all().exclude_gpu(true).imported_only(true);
    let ledger = run(&api, &opts).await;

    let snapshot = ledger.snapshot().await;
    assert_eq!(snapshot.success, names(&["legacy"]));
    assert_eq!(snapshot.skipped.len(), 2);
    assert_eq!(api.total_patch_calls(), 1);
}

#[tokio::test]
async fn test_exclusion_wins_over_explicit_name() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("a", None, false)
            .with_function("b", None, false),
    );

    let mut opts = options();
    opts.functions = names(&["a", "b"]);
    opts.filter = TargetFilter::allow_all().exclude_functions(["b"]);
    let ledger = run(&api, &opts).await;

    assert_eq!(ledger.outcome(&FunctionName::new("b")).await, Some(Outcome::Skipped));
    assert_eq!(api.patch_calls("b"), 0);
}

#[tokio::test]
async fn test_missing_explicit_name_is_recorded() {
    let api = Arc::new(FakeApi::new().with_function("a", None, false));

    let mut opts = options();
    opts.functions = names(&["a", "ghost"]);
    let ledger = run(&api, &opts).await;

    let (message, retryable) = failure(&ledger, "ghost").await;
    assert!(message.contains("not found"));
    assert!(retryable);
    assert_eq!(ledger.outcome(&FunctionName::new("a")).await, Some(Outcome::Success));
}

#[tokio::test]
async fn test_poll_timeout_differs_from_terminal_error() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("slow", None, false)
            .with_function("broken", None, false)
            .with_statuses("slow", vec![ScriptedStatus::State(FunctionState::Building)])
            .with_statuses("broken", vec![ScriptedStatus::State(FunctionState::Error)]),
    );

    let mut opts = options();
    opts.wait = fast_wait(100);
    let ledger = run(&api, &opts).await;

    let (slow_message, slow_retryable) = failure(&ledger, "slow").await;
    let (broken_message, broken_retryable) = failure(&ledger, "broken").await;

    assert!(slow_retryable);
    assert!(broken_retryable);
    assert!(slow_message.contains("timed out"));
    assert!(broken_message.contains("terminal state error"));
    assert_ne!(slow_message, broken_message);
}

#[tokio::test]
async fn test_panicking_task_is_recorded_as_retryable() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("a", None, false)
            .with_function("crash", None, false)
            .with_patch_panic("crash"),
    );

    let ledger = run(&api, &options()).await;

    let (message, retryable) = failure(&ledger, "crash").await;
    assert!(retryable);
    assert!(message.contains("panicked"));
    assert_eq!(ledger.outcome(&FunctionName::new("a")).await, Some(Outcome::Success));
}

#[tokio::test]
async fn test_cancelled_run_records_every_target() {
    let api = Arc::new(
        FakeApi::new()
            .with_function("a", None, false)
            .with_function("b", None, false)
            .with_function("c", None, false),
    );
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut opts = options();
    opts.report_path = Some(report.clone());
    let ledger = Redeployer::new(api.clone()).run(&opts, cancel).await.unwrap();

    assert_eq!(api.total_patch_calls(), 0);
    assert_eq!(ledger.get_retryable_names().await, names(&["a", "b", "c"]));

    let saved = Ledger::load_from_file(&report).await.unwrap();
    assert_eq!(saved.get_retryable_names().await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_target_gets_exactly_one_outcome() {
    let mut api = FakeApi::new().with_patch_delay(Duration::from_millis(5));
    for i in 0..20 {
        let name = format!("fn-{:02}", i);
        api = api.with_function(&name, Some(if i % 5 == 0 { "legacy" } else { "web" }), false);
        if i % 3 == 0 {
            api = api.with_patch_failure(&name, StatusCode::INTERNAL_SERVER_ERROR);
        }
        if i % 7 == 0 {
            api = api.with_patch_failure(&name, StatusCode::PRECONDITION_FAILED);
        }
    }
    let api = Arc::new(api);
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");

    let mut opts = options();
    opts.concurrency = 4;
    opts.filter = TargetFilter::allow_all().exclude_projects(["legacy"]);
    opts.report_path = Some(report.clone());
    opts.checkpoint = true;
    let ledger = run(&api, &opts).await;

    let snapshot = ledger.snapshot().await;
    assert_eq!(snapshot.len(), 20);
    assert_eq!(snapshot.skipped.len(), 4);
    assert!(api.peak_patches() <= 4);

    let saved = Ledger::load_from_file(&report).await.unwrap();
    assert_eq!(saved.snapshot().await, snapshot);

    // Non-retryable failures never come back in a resume.
    for name in saved.get_retryable_names().await {
        let idx: usize = name.as_str()[3..].parse().unwrap();
        assert!(idx % 7 != 0);
    }
}
