//! Per-function state change and completion wait.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{
    ApiError, DesiredState, FunctionApi, FunctionPatch, FunctionState, Target, is_retryable,
};
use crate::types::FunctionName;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(180);

/// How long, and how often, to poll a function after patching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Errors from patching a single function.
#[derive(Debug)]
pub enum PatchError {
    /// The API rejected the patch or could not be reached.
    Api(ApiError),

    /// The function never reached a terminal state within the wait timeout.
    WaitTimeout {
        name: FunctionName,
        timeout: Duration,
        last_state: Option<FunctionState>,
    },

    /// The function settled in a terminal state other than the desired one.
    TerminalState {
        name: FunctionName,
        desired: DesiredState,
        state: FunctionState,
        message: Option<String>,
    },

    /// The run was cancelled while the patch was in progress.
    Cancelled,
}

impl PatchError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        is_retryable(self)
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api(err) => write!(f, "{}", err),
            Self::WaitTimeout {
                name,
                timeout,
                last_state,
            } => {
                write!(
                    f,
                    "timed out after {}s waiting for function {} to settle",
                    timeout.as_secs_f64(),
                    name
                )?;
                if let Some(state) = last_state {
                    write!(f, " (last state: {})", state)?;
                }
                Ok(())
            }
            Self::TerminalState {
                name,
                desired,
                state,
                message,
            } => {
                write!(
                    f,
                    "function {} reached terminal state {} without becoming {}",
                    name, state, desired
                )?;
                if let Some(message) = message.as_deref().filter(|m| !m.is_empty()) {
                    write!(f, ": {}", message)?;
                }
                Ok(())
            }
            Self::Cancelled => write!(f, "cancelled before completion"),
        }
    }
}

impl Error for PatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Api(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ApiError> for PatchError {
    fn from(err: ApiError) -> Self {
        Self::Api(err)
    }
}

/// Where a completion wait stands after observing a remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitState {
    Pending,
    Ready,
    TerminalError(FunctionState),
}

impl WaitState {
    pub fn observe(observed: &FunctionState, desired: DesiredState) -> Self {
        if *observed == desired.target_state() {
            Self::Ready
        } else if observed.is_terminal() {
            Self::TerminalError(observed.clone())
        } else {
            Self::Pending
        }
    }
}

/// Patch one function to `desired` and, when `wait` is set, poll until it
/// settles.
pub async fn patch_function(
    api: &dyn FunctionApi,
    target: &Target,
    desired: DesiredState,
    wait: Option<WaitOptions>,
    cancel: &CancellationToken,
) -> Result<(), PatchError> {
    let patch = FunctionPatch {
        desired_state: desired,
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PatchError::Cancelled),
        result = api.patch_function(&target.namespace, &target.name, &patch) => result?,
    }
    debug!(function = %target.name, desired_state = %desired, "Patch accepted");

    match wait {
        Some(options) => wait_for_state(api, target, desired, options, cancel).await,
        None => Ok(()),
    }
}

/// Poll a function's status until it reaches a terminal state or the wait
/// times out. Status fetch failures are retried on the next tick.
pub async fn wait_for_state(
    api: &dyn FunctionApi,
    target: &Target,
    desired: DesiredState,
    options: WaitOptions,
    cancel: &CancellationToken,
) -> Result<(), PatchError> {
    let deadline = Instant::now() + options.timeout;
    let mut ticker = tokio::time::interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_state = None;

    let timed_out = |last_state: Option<FunctionState>| PatchError::WaitTimeout {
        name: target.name.clone(),
        timeout: options.timeout,
        last_state,
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(timed_out(last_state)),
            _ = ticker.tick() => {}
        }

        let status = api.get_function(&target.namespace, &target.name);
        let fetch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchError::Cancelled),
            fetched = tokio::time::timeout_at(deadline, status) => fetched,
        };

        let record = match fetch {
            Err(_elapsed) => return Err(timed_out(last_state)),
            Ok(Err(err)) => {
                warn!(function = %target.name, error = %err, "Failed to fetch function status");
                continue;
            }
            Ok(Ok(record)) => record,
        };

        let state = record.status.state;
        match WaitState::observe(&state, desired) {
            WaitState::Ready => {
                info!(function = %target.name, state = %state, "Function reached desired state");
                return Ok(());
            }
            WaitState::TerminalError(state) => {
                return Err(PatchError::TerminalState {
                    name: target.name.clone(),
                    desired,
                    state,
                    message: record.status.message,
                });
            }
            WaitState::Pending => {
                debug!(function = %target.name, state = %state, "Function still transitioning");
                last_state = Some(state);
            }
        }
    }
}
