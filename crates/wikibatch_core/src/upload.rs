use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

use crate::client::{ActionClient, WriteAction};
use crate::namespace::Title;
use crate::retry::{
    CallResolution, CancelFlag, FailedCall, FailureKind, RetryPolicy, call_with_retries,
};

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Uploading { offset: u64 },
    Staged { file_key: String },
    Published,
    Abandoned,
}

/// One file moving through the chunked upload sub-protocol: chunks are sent
/// in order with at most one in flight, the server-assigned stash key is
/// recorded after the first acknowledgment, and a finalize call promotes the
/// staged file to a published revision.
#[derive(Debug)]
pub struct UploadSession {
    file: File,
    source: PathBuf,
    file_name: String,
    description: String,
    summary: String,
    total_size: u64,
    offset: u64,
    file_key: Option<String>,
    chunk_size: u64,
    state: UploadState,
}

impl UploadSession {
    pub fn open(
        source: &Path,
        target: &Title,
        description: &str,
        summary: &str,
        chunk_size: u64,
    ) -> Result<Self> {
        let file =
            File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
        let total_size = file
            .metadata()
            .with_context(|| format!("failed to inspect {}", source.display()))?
            .len();
        if total_size == 0 {
            bail!("refusing to upload empty file {}", source.display());
        }
        Ok(Self {
            file,
            source: source.to_path_buf(),
            file_name: bare_file_name(target),
            description: description.to_string(),
            summary: summary.to_string(),
            total_size,
            offset: 0,
            file_key: None,
            chunk_size: chunk_size.max(1),
            state: UploadState::Idle,
        })
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn expected_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Drive the session to Published or Abandoned. Retryable failures
    /// re-send the same chunk without advancing the offset; fatal failures,
    /// retry exhaustion, and cancellation abandon the stash.
    pub fn run(
        &mut self,
        client: &ActionClient,
        policy: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> Result<(), FailedCall> {
        while self.offset < self.total_size {
            self.state = UploadState::Uploading {
                offset: self.offset,
            };
            let bytes = match self.read_chunk() {
                Ok(bytes) => bytes,
                Err(error) => return self.abandon(FailureKind::Fatal, format!("{error:#}")),
            };
            let sent = bytes.len() as u64;
            let action = WriteAction::UploadChunk {
                file_name: self.file_name.clone(),
                total_size: self.total_size,
                offset: self.offset,
                file_key: self.file_key.clone(),
                bytes,
            };
            match call_with_retries(policy, cancel, || client.execute(&action)) {
                CallResolution::Completed(payload) => {
                    if let Some(key) = stash_key_from(&payload) {
                        self.file_key = Some(key);
                    }
                    self.offset += sent;
                }
                CallResolution::Failed(failure) => {
                    return self.abandon(failure.kind, failure.cause);
                }
            }
        }

        let file_key = match self.file_key.clone() {
            Some(key) => key,
            None => {
                return self.abandon(
                    FailureKind::Fatal,
                    format!("server never assigned a stash key for {}", self.file_name),
                );
            }
        };
        self.state = UploadState::Staged {
            file_key: file_key.clone(),
        };

        let finalize = WriteAction::UploadFinalize {
            file_name: self.file_name.clone(),
            file_key,
            text: self.description.clone(),
            summary: self.summary.clone(),
        };
        match call_with_retries(policy, cancel, || client.execute(&finalize)) {
            CallResolution::Completed(_) => {
                self.state = UploadState::Published;
                Ok(())
            }
            CallResolution::Failed(failure) => self.abandon(failure.kind, failure.cause),
        }
    }

    fn abandon(&mut self, kind: FailureKind, cause: String) -> Result<(), FailedCall> {
        self.state = UploadState::Abandoned;
        Err(FailedCall { kind, cause })
    }

    fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let remaining = self.total_size - self.offset;
        let length = remaining.min(self.chunk_size);
        let mut buffer =
            vec![0u8; usize::try_from(length).context("chunk does not fit in memory")?];
        self.file
            .seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("failed to seek {}", self.source.display()))?;
        self.file
            .read_exact(&mut buffer)
            .with_context(|| format!("failed to read {}", self.source.display()))?;
        Ok(buffer)
    }
}

/// The upload API wants the bare file name, without the File: prefix.
fn bare_file_name(target: &Title) -> String {
    match target.text().split_once(':') {
        Some((_, rest)) => rest.trim().to_string(),
        None => target.text().to_string(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct UploadResponse {
    upload: Option<UploadPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadPayload {
    filekey: Option<String>,
}

fn stash_key_from(payload: &Value) -> Option<String> {
    serde_json::from_value::<UploadResponse>(payload.clone())
        .ok()?
        .upload?
        .filekey
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{UploadSession, UploadState};
    use crate::client::ActionClient;
    use crate::namespace::{NS_FILE, NamespaceResolver};
    use crate::retry::{CancelFlag, FailureKind, RetryPolicy};
    use crate::testkit::{
        self, ScriptedTransport, api_error, csrf_token, upload_continue, upload_success,
    };

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
        }
    }

    fn session(content: &[u8], chunk_size: u64) -> (UploadSession, tempfile::TempDir) {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("Test.png");
        fs::write(&source, content).expect("write source");
        let resolver = NamespaceResolver::new();
        let target = resolver.coerce_into("Test.png", NS_FILE);
        let session = UploadSession::open(&source, &target, "desc", "summary", chunk_size)
            .expect("open session");
        (session, temp)
    }

    #[test]
    fn uneven_file_uploads_ceiling_number_of_chunks() {
        let transport = ScriptedTransport::new(|request| {
            if testkit::is_token_query(request) {
                return csrf_token("T0");
            }
            if testkit::is_chunk_request(request) {
                let offset: u64 = request.param("offset").expect("offset").parse().expect("u64");
                let next = offset + request.file.as_ref().expect("file").bytes.len() as u64;
                if next < 10 {
                    return upload_continue("K1", next);
                }
                return upload_success("K1");
            }
            upload_success("K1")
        });
        let client = ActionClient::new(Box::new(transport.clone()));
        let (mut session, _temp) = session(b"0123456789", 4);
        assert_eq!(session.expected_chunks(), 3);

        session
            .run(&client, &fast_policy(), &CancelFlag::new())
            .expect("upload");
        assert_eq!(*session.state(), UploadState::Published);

        let chunks: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(testkit::is_chunk_request)
            .collect();
        assert_eq!(chunks.len(), 3);
        let offsets: Vec<&str> = chunks
            .iter()
            .map(|request| request.param("offset").expect("offset"))
            .collect();
        assert_eq!(offsets, vec!["0", "4", "8"]);
        let lengths: Vec<usize> = chunks
            .iter()
            .map(|request| request.file.as_ref().expect("file").bytes.len())
            .collect();
        assert_eq!(lengths, vec![4, 4, 2]);
        assert_eq!(transport.count_where(testkit::is_finalize_request), 1);
    }

    #[test]
    fn stash_key_from_first_chunk_rides_along_on_later_chunks() {
        let transport = ScriptedTransport::new(|request| {
            if testkit::is_token_query(request) {
                return csrf_token("T0");
            }
            if testkit::is_chunk_request(request) {
                let offset: u64 = request.param("offset").expect("offset").parse().expect("u64");
                if offset == 0 {
                    assert_eq!(request.param("filekey"), None);
                    return upload_continue("K1", 4);
                }
                assert_eq!(request.param("filekey"), Some("K1"));
                return upload_success("K1");
            }
            assert_eq!(request.param("filekey"), Some("K1"));
            assert_eq!(request.param("comment"), Some("summary"));
            assert_eq!(request.param("text"), Some("desc"));
            upload_success("K1")
        });
        let client = ActionClient::new(Box::new(transport));
        let (mut session, _temp) = session(b"01234567", 4);
        session
            .run(&client, &fast_policy(), &CancelFlag::new())
            .expect("upload");
        assert_eq!(*session.state(), UploadState::Published);
    }

    #[test]
    fn retryable_chunk_failure_resends_the_same_offset() {
        let throttled = Arc::new(AtomicUsize::new(0));
        let throttle = throttled.clone();
        let transport = ScriptedTransport::new(move |request| {
            if testkit::is_token_query(request) {
                return csrf_token("T0");
            }
            if testkit::is_chunk_request(request) {
                let offset: u64 = request.param("offset").expect("offset").parse().expect("u64");
                if offset == 4 && throttle.fetch_add(1, Ordering::SeqCst) == 0 {
                    return api_error("ratelimited", "slow down");
                }
                let next = offset + request.file.as_ref().expect("file").bytes.len() as u64;
                if next < 10 {
                    return upload_continue("K1", next);
                }
                return upload_success("K1");
            }
            upload_success("K1")
        });
        let client = ActionClient::new(Box::new(transport.clone()));
        let (mut session, _temp) = session(b"0123456789", 4);
        session
            .run(&client, &fast_policy(), &CancelFlag::new())
            .expect("upload");

        let offsets: Vec<String> = transport
            .requests()
            .into_iter()
            .filter(testkit::is_chunk_request)
            .map(|request| request.param("offset").expect("offset").to_string())
            .collect();
        assert_eq!(offsets, vec!["0", "4", "4", "8"]);
    }

    #[test]
    fn fatal_failure_on_finalize_abandons_the_session() {
        let transport = ScriptedTransport::new(|request| {
            if testkit::is_token_query(request) {
                return csrf_token("T0");
            }
            if testkit::is_chunk_request(request) {
                return upload_success("K1");
            }
            api_error("fileexists-no-change", "The upload is an exact duplicate.")
        });
        let client = ActionClient::new(Box::new(transport));
        let (mut session, _temp) = session(b"0123", 4);
        let failure = session
            .run(&client, &fast_policy(), &CancelFlag::new())
            .expect_err("must fail");
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(*session.state(), UploadState::Abandoned);
    }

    #[test]
    fn exhausted_chunk_retries_abandon_the_session() {
        let transport = ScriptedTransport::new(|request| {
            if testkit::is_token_query(request) {
                return csrf_token("T0");
            }
            api_error("ratelimited", "slow down")
        });
        let client = ActionClient::new(Box::new(transport.clone()));
        let (mut session, _temp) = session(b"0123", 4);
        let failure = session
            .run(&client, &fast_policy(), &CancelFlag::new())
            .expect_err("must fail");
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);
        assert_eq!(*session.state(), UploadState::Abandoned);
        assert_eq!(transport.count_where(testkit::is_chunk_request), 3);
    }

    #[test]
    fn cancellation_mid_upload_abandons_the_stash() {
        let cancel = CancelFlag::new();
        let cancel_for_script = cancel.clone();
        let transport = ScriptedTransport::new(move |request| {
            if testkit::is_token_query(request) {
                return csrf_token("T0");
            }
            let offset: u64 = request.param("offset").expect("offset").parse().expect("u64");
            if offset == 4 {
                cancel_for_script.cancel();
            }
            upload_continue("K1", offset + 4)
        });
        let client = ActionClient::new(Box::new(transport.clone()));
        let (mut session, _temp) = session(b"0123456789", 4);
        let failure = session
            .run(&client, &fast_policy(), &cancel)
            .expect_err("must fail");
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(*session.state(), UploadState::Abandoned);
        assert_eq!(transport.count_where(testkit::is_chunk_request), 2);
        assert_eq!(transport.count_where(testkit::is_finalize_request), 0);
    }

    #[test]
    fn missing_source_file_fails_to_open() {
        let temp = tempdir().expect("tempdir");
        let resolver = NamespaceResolver::new();
        let target = resolver.coerce_into("Missing.png", NS_FILE);
        let error = UploadSession::open(
            &temp.path().join("Missing.png"),
            &target,
            "desc",
            "summary",
            4,
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("failed to open"));
    }

    #[test]
    fn target_title_loses_the_file_prefix_on_the_wire() {
        let transport = ScriptedTransport::new(|request| {
            if testkit::is_token_query(request) {
                return csrf_token("T0");
            }
            assert_eq!(request.param("filename"), Some("Test.png"));
            upload_success("K1")
        });
        let client = ActionClient::new(Box::new(transport));
        let (mut session, _temp) = session(b"0123", 4);
        session
            .run(&client, &fast_policy(), &CancelFlag::new())
            .expect("upload");
    }
}
