pub mod client;
pub mod config;
pub mod dispatcher;
pub mod namespace;
pub mod retry;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testkit;

pub use client::{ActionClient, ActionOutcome, EditMode, WriteAction};
pub use config::{BotConfig, ClientConfig, load_config};
pub use dispatcher::{ActionItem, BatchDispatcher, BatchOptions, BatchReport, FailedItem};
pub use namespace::{NamespaceResolver, Title};
pub use retry::{CancelFlag, FailureKind, RetryPolicy};
pub use upload::{UploadSession, UploadState};
