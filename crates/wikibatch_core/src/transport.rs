use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
pub use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::Value;

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// One MediaWiki API call: parameter pairs plus an optional file part for
/// the chunked-upload call shape.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: RequestMethod,
    pub params: Vec<(String, String)>,
    pub file: Option<FilePart>,
}

impl ApiRequest {
    pub fn get(params: &[(&str, String)]) -> Self {
        Self {
            method: RequestMethod::Get,
            params: owned_pairs(params),
            file: None,
        }
    }

    pub fn post(params: &[(&str, String)]) -> Self {
        Self {
            method: RequestMethod::Post,
            params: owned_pairs(params),
            file: None,
        }
    }

    pub fn with_file(mut self, field: &str, file_name: &str, bytes: Vec<u8>) -> Self {
        self.file = Some(FilePart {
            field: field.to_string(),
            file_name: file_name.to_string(),
            bytes,
        });
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn action(&self) -> Option<&str> {
        self.param("action")
    }
}

fn owned_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

/// A transport-level failure, before any API payload was decoded. The
/// retryable flag covers timeouts, connect errors, and interrupted requests.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub retryable: bool,
    pub message: String,
}

impl TransportFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportFailure {}

pub trait Transport: Send + Sync {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportFailure>;
}

pub struct HttpTransport {
    client: Client,
    api_url: String,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            user_agent: config.user_agent.clone(),
        })
    }

    fn expand_params(request: &ApiRequest) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(request.params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in &request.params {
            if !value.is_empty() {
                pairs.push((key.clone(), value.clone()));
            }
        }
        pairs
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportFailure> {
        let pairs = Self::expand_params(request);
        let builder = match (request.method, &request.file) {
            (RequestMethod::Get, _) => self.client.get(&self.api_url).query(&pairs),
            (RequestMethod::Post, None) => self.client.post(&self.api_url).form(&pairs),
            (RequestMethod::Post, Some(file)) => {
                let mut form = Form::new();
                for (key, value) in pairs {
                    form = form.text(key, value);
                }
                form = form.part(
                    file.field.clone(),
                    Part::bytes(file.bytes.clone()).file_name(file.file_name.clone()),
                );
                self.client.post(&self.api_url).multipart(form)
            }
        };

        let response = builder
            .header("User-Agent", self.user_agent.clone())
            .send()
            .map_err(from_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Ok(ApiResponse {
                status,
                body: Value::Null,
            });
        }
        let body: Value = response.json().map_err(|error| {
            TransportFailure::fatal(format!(
                "failed to decode MediaWiki API JSON response: {error}"
            ))
        })?;
        Ok(ApiResponse { status, body })
    }
}

fn from_reqwest_error(error: reqwest::Error) -> TransportFailure {
    TransportFailure {
        retryable: error.is_timeout() || error.is_connect() || error.is_request(),
        message: format!("failed to call MediaWiki API: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiRequest, HttpTransport, TransportFailure};

    #[test]
    fn expand_params_adds_format_and_skips_empty_values() {
        let request = ApiRequest::post(&[
            ("action", "edit".to_string()),
            ("summary", String::new()),
            ("title", "Alpha".to_string()),
        ]);
        let pairs = HttpTransport::expand_params(&request);
        assert_eq!(pairs[0], ("format".to_string(), "json".to_string()));
        assert_eq!(pairs[1], ("formatversion".to_string(), "2".to_string()));
        assert!(pairs.iter().any(|(key, value)| key == "title" && value == "Alpha"));
        assert!(!pairs.iter().any(|(key, _)| key == "summary"));
    }

    #[test]
    fn param_lookup_finds_values_by_key() {
        let request = ApiRequest::get(&[("action", "query".to_string())]);
        assert_eq!(request.action(), Some("query"));
        assert_eq!(request.param("meta"), None);
    }

    #[test]
    fn with_file_attaches_the_chunk_part() {
        let request = ApiRequest::post(&[("action", "upload".to_string())]).with_file(
            "chunk",
            "Test.png",
            vec![1, 2, 3],
        );
        let file = request.file.expect("file part");
        assert_eq!(file.field, "chunk");
        assert_eq!(file.file_name, "Test.png");
        assert_eq!(file.bytes, vec![1, 2, 3]);
    }

    #[test]
    fn transport_failure_reports_its_message() {
        let failure = TransportFailure::retryable("timed out");
        assert!(failure.retryable);
        assert_eq!(failure.to_string(), "timed out");
        assert!(!TransportFailure::fatal("bad").retryable);
    }
}
