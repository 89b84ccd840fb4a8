use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::client::ActionOutcome;

/// Bounded retry with exponential backoff, carried as data so the schedule
/// is a caller decision rather than control flow buried in the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
    }
}

/// Clonable handle for interrupting a running batch from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fatal,
    RetriesExhausted,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedCall {
    pub kind: FailureKind,
    pub cause: String,
}

pub(crate) enum CallResolution {
    Completed(Value),
    Failed(FailedCall),
}

pub(crate) fn call_with_retries(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    mut call: impl FnMut() -> ActionOutcome,
) -> CallResolution {
    let budget = policy.max_attempts.max(1);
    let mut last_cause = String::new();
    for attempt in 0..budget {
        if cancel.is_cancelled() {
            return CallResolution::Failed(FailedCall {
                kind: FailureKind::Cancelled,
                cause: "batch cancelled".to_string(),
            });
        }
        match call() {
            ActionOutcome::Success(payload) => return CallResolution::Completed(payload),
            ActionOutcome::FatalFailure(cause) => {
                return CallResolution::Failed(FailedCall {
                    kind: FailureKind::Fatal,
                    cause,
                });
            }
            ActionOutcome::RetryableFailure(cause) => {
                last_cause = cause;
                if attempt + 1 < budget {
                    sleep(policy.backoff_delay(attempt));
                }
            }
        }
    }
    CallResolution::Failed(FailedCall {
        kind: FailureKind::RetriesExhausted,
        cause: last_cause,
    })
}
