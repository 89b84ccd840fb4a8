use std::sync::{Arc, Mutex, PoisonError};

use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::transport::{ApiRequest, ApiResponse, Transport, TransportFailure};

type Script = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportFailure> + Send + Sync;

/// Scripted stand-in for the HTTP transport: every request is logged, then
/// answered by the script closure.
#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    inner: Arc<Inner>,
}

struct Inner {
    script: Box<Script>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(
        script: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportFailure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Box::new(script),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count_where(&self, predicate: impl Fn(&ApiRequest) -> bool) -> usize {
        self.requests()
            .iter()
            .filter(|request| predicate(request))
            .count()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportFailure> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        (self.inner.script)(request)
    }
}

pub(crate) fn ok(body: Value) -> Result<ApiResponse, TransportFailure> {
    Ok(ApiResponse {
        status: StatusCode::OK,
        body,
    })
}

pub(crate) fn http_status(status: StatusCode) -> Result<ApiResponse, TransportFailure> {
    Ok(ApiResponse {
        status,
        body: Value::Null,
    })
}

pub(crate) fn api_error(code: &str, info: &str) -> Result<ApiResponse, TransportFailure> {
    ok(json!({"error": {"code": code, "info": info}}))
}

pub(crate) fn csrf_token(token: &str) -> Result<ApiResponse, TransportFailure> {
    ok(json!({"query": {"tokens": {"csrftoken": token}}}))
}

pub(crate) fn login_token(token: &str) -> Result<ApiResponse, TransportFailure> {
    ok(json!({"query": {"tokens": {"logintoken": token}}}))
}

pub(crate) fn login_success() -> Result<ApiResponse, TransportFailure> {
    ok(json!({"login": {"result": "Success"}}))
}

pub(crate) fn edit_success() -> Result<ApiResponse, TransportFailure> {
    ok(json!({"edit": {"result": "Success", "newrevid": 9001}}))
}

pub(crate) fn delete_success(title: &str) -> Result<ApiResponse, TransportFailure> {
    ok(json!({"delete": {"title": title, "logid": 42}}))
}

pub(crate) fn purge_success() -> Result<ApiResponse, TransportFailure> {
    ok(json!({"purge": [{"purged": true}]}))
}

pub(crate) fn upload_continue(file_key: &str, offset: u64) -> Result<ApiResponse, TransportFailure> {
    ok(json!({"upload": {"result": "Continue", "filekey": file_key, "offset": offset}}))
}

pub(crate) fn upload_success(file_key: &str) -> Result<ApiResponse, TransportFailure> {
    ok(json!({"upload": {"result": "Success", "filekey": file_key}}))
}

/// Matches the csrf token fetch, not the login token fetch.
pub(crate) fn is_token_query(request: &ApiRequest) -> bool {
    request.param("meta") == Some("tokens") && request.param("type").is_none()
}

pub(crate) fn is_chunk_request(request: &ApiRequest) -> bool {
    request.action() == Some("upload") && request.file.is_some()
}

pub(crate) fn is_finalize_request(request: &ApiRequest) -> bool {
    request.action() == Some("upload") && request.file.is_none()
}
