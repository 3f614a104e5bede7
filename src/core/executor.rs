//! Bounded concurrency executor.
//!
//! Runs named fallible tasks with at most `max_concurrency` of them active at
//! once. Every task runs to completion regardless of how its siblings end;
//! panics are caught at the task boundary and reported as errors.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Why a single task did not complete successfully.
#[derive(Debug)]
pub enum TaskError {
    /// The task body returned an error.
    Failed(anyhow::Error),
    /// The task body panicked.
    Panicked {
        message: String,
        /// `file:line` of the panic, when the hook saw it.
        location: Option<String>,
        /// Backtrace, only when `RUST_BACKTRACE` enables capture.
        trace: Option<String>,
    },
    /// The run was cancelled before the task acquired a slot.
    Cancelled,
    /// The runtime dropped the task (runtime shutdown).
    Aborted(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => write!(f, "{:#}", err),
            Self::Panicked {
                message,
                location: Some(location),
                ..
            } => write!(f, "task panicked at {}: {}", location, message),
            Self::Panicked { message, .. } => write!(f, "task panicked: {}", message),
            Self::Cancelled => write!(f, "cancelled before start"),
            Self::Aborted(msg) => write!(f, "task aborted: {}", msg),
        }
    }
}

/// A task that ended in error, tagged with its name.
#[derive(Debug)]
pub struct TaskFailure {
    pub name: String,
    pub error: TaskError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

/// Aggregate of every failed task in a [`BoundedExecutor::wait`] call.
#[derive(Debug)]
pub struct ExecutorError {
    pub failures: Vec<TaskFailure>,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutorError {}

#[derive(Debug)]
struct PanicSnapshot {
    location: Option<String>,
    trace: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSnapshot>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the current one that records where the last
/// panic on this thread happened. `catch_unwind` runs on the panicking
/// thread, so the task wrapper can pick the snapshot up afterwards.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|loc| format!("{}:{}", loc.file(), loc.line()));
            let backtrace = Backtrace::capture();
            let trace = (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string());
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(PanicSnapshot { location, trace }));
            previous(info);
        }));
    });
}

fn take_panic_snapshot() -> PanicSnapshot {
    LAST_PANIC
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or(PanicSnapshot {
            location: None,
            trace: None,
        })
}

/// Fan-out executor with a fixed number of concurrency slots.
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: JoinSet<(String, Result<(), TaskError>)>,
}

impl BoundedExecutor {
    /// Create an executor. `max_concurrency == 0` means unbounded.
    pub fn new(max_concurrency: usize, cancel: CancellationToken) -> Self {
        install_panic_hook();
        let permits = if max_concurrency == 0 {
            Semaphore::MAX_PERMITS
        } else {
            max_concurrency
        };

        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            cancel,
            tasks: JoinSet::new(),
        }
    }

    /// Number of tasks submitted and not yet collected by `wait`.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Submit a task. It starts once a concurrency slot is free.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (name, Err(TaskError::Cancelled)),
                permit = semaphore.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return (name, Err(TaskError::Cancelled));
            };

            debug!(task = %name, "Task started");
            let result = AssertUnwindSafe(async move { task().await })
                .catch_unwind()
                .await;

            let result = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(TaskError::Failed(err)),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let snapshot = take_panic_snapshot();
                    error!(
                        task = %name,
                        panic = %message,
                        location = snapshot.location.as_deref().unwrap_or("unknown"),
                        "Task panicked"
                    );
                    Err(TaskError::Panicked {
                        message,
                        location: snapshot.location,
                        trace: snapshot.trace,
                    })
                }
            };
            (name, result)
        });
    }

    /// Wait for every submitted task. Never cancels the remaining tasks when
    /// one fails; the aggregated error is for reporting only.
    pub async fn wait(mut self) -> Result<(), ExecutorError> {
        let mut failures = Vec::new();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(error))) => failures.push(TaskFailure { name, error }),
                Err(join_err) => failures.push(TaskFailure {
                    name: String::from("<unknown>"),
                    error: TaskError::Aborted(join_err.to_string()),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecutorError { failures })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
