use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serde::Serialize;

use crate::client::{ActionClient, EditMode, WriteAction};
use crate::namespace::Title;
use crate::retry::{CallResolution, CancelFlag, FailureKind, RetryPolicy, call_with_retries};
use crate::upload::{DEFAULT_CHUNK_SIZE, UploadSession};

pub const DEFAULT_CONCURRENCY: usize = 2;

/// One unit of mutating work. Immutable once constructed; consumed exactly
/// once by the dispatcher.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ActionItem {
    Delete {
        title: Title,
        reason: String,
    },
    Edit {
        title: Title,
        text: String,
        summary: String,
        mode: EditMode,
    },
    Move {
        from: Title,
        to: Title,
        reason: String,
    },
    Purge {
        titles: Vec<Title>,
    },
    Upload {
        source: PathBuf,
        target: Title,
        description: String,
        summary: String,
    },
}

impl ActionItem {
    pub fn label(&self) -> String {
        match self {
            Self::Delete { title, .. } => format!("delete {title}"),
            Self::Edit { title, .. } => format!("edit {title}"),
            Self::Move { from, to, .. } => format!("move {from} -> {to}"),
            Self::Purge { titles } => format!("purge {} pages", titles.len()),
            Self::Upload { target, .. } => format!("upload {target}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub chunk_size: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// An item that could not be completed, with the classification that made it
/// permanent.
#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub item: ActionItem,
    pub kind: FailureKind,
    pub cause: String,
}

/// Partial failure as data: successful items are absent, failed items appear
/// exactly once in original input order.
#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedItem>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs a homogeneous list of action items against the client with a fixed
/// worker pool. A slow or throttled item never blocks unrelated items, and
/// the pool size caps pressure on the remote service.
pub struct BatchDispatcher<'a> {
    client: &'a ActionClient,
    options: BatchOptions,
    cancel: CancelFlag,
}

impl<'a> BatchDispatcher<'a> {
    pub fn new(client: &'a ActionClient, options: BatchOptions) -> Self {
        Self {
            client,
            options,
            cancel: CancelFlag::new(),
        }
    }

    /// Use an externally owned cancellation flag, e.g. one wired to a signal
    /// handler.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for interrupting the batch from another thread. In-flight
    /// calls finish; unclaimed items are reported as cancelled without being
    /// attempted.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn run(&self, items: Vec<ActionItem>) -> BatchReport {
        let total = items.len();
        if total == 0 {
            return BatchReport::default();
        }
        let workers = self.options.concurrency.clamp(1, total);
        let next = AtomicUsize::new(0);
        let failures: Mutex<Vec<(usize, FailedItem)>> = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        if index >= items.len() {
                            break;
                        }
                        let item = &items[index];
                        let failure = if self.cancel.is_cancelled() {
                            Some(FailedItem {
                                item: item.clone(),
                                kind: FailureKind::Cancelled,
                                cause: "batch cancelled before the item was attempted".to_string(),
                            })
                        } else {
                            self.run_item(item)
                        };
                        if let Some(failure) = failure {
                            failures
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push((index, failure));
                        }
                    }
                });
            }
        });

        let mut failures = failures
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        failures.sort_by_key(|(index, _)| *index);
        let failed: Vec<FailedItem> = failures.into_iter().map(|(_, failure)| failure).collect();
        BatchReport {
            total,
            succeeded: total - failed.len(),
            failed,
        }
    }

    fn run_item(&self, item: &ActionItem) -> Option<FailedItem> {
        let resolution = match item {
            ActionItem::Upload {
                source,
                target,
                description,
                summary,
            } => {
                let mut session = match UploadSession::open(
                    source,
                    target,
                    description,
                    summary,
                    self.options.chunk_size,
                ) {
                    Ok(session) => session,
                    Err(error) => {
                        return Some(FailedItem {
                            item: item.clone(),
                            kind: FailureKind::Fatal,
                            cause: format!("{error:#}"),
                        });
                    }
                };
                return match session.run(self.client, &self.options.retry, &self.cancel) {
                    Ok(()) => None,
                    Err(failure) => Some(FailedItem {
                        item: item.clone(),
                        kind: failure.kind,
                        cause: failure.cause,
                    }),
                };
            }
            ActionItem::Delete { title, reason } => self.run_single(WriteAction::Delete {
                title: title.clone(),
                reason: reason.clone(),
            }),
            ActionItem::Edit {
                title,
                text,
                summary,
                mode,
            } => self.run_single(WriteAction::Edit {
                title: title.clone(),
                text: text.clone(),
                summary: summary.clone(),
                mode: *mode,
            }),
            ActionItem::Move { from, to, reason } => self.run_single(WriteAction::Move {
                from: from.clone(),
                to: to.clone(),
                reason: reason.clone(),
            }),
            ActionItem::Purge { titles } => self.run_single(WriteAction::Purge {
                titles: titles.clone(),
            }),
        };
        match resolution {
            CallResolution::Completed(_) => None,
            CallResolution::Failed(failure) => Some(FailedItem {
                item: item.clone(),
                kind: failure.kind,
                cause: failure.cause,
            }),
        }
    }

    fn run_single(&self, action: WriteAction) -> CallResolution {
        call_with_retries(&self.options.retry, &self.cancel, || {
            self.client.execute(&action)
        })
    }
}
