use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::namespace::Title;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    Replace,
    Prepend,
    Append,
}

/// One low-level mutating call against the write API.
#[derive(Debug, Clone)]
pub enum WriteAction {
    Edit {
        title: Title,
        text: String,
        summary: String,
        mode: EditMode,
    },
    Delete {
        title: Title,
        reason: String,
    },
    Move {
        from: Title,
        to: Title,
        reason: String,
    },
    Purge {
        titles: Vec<Title>,
    },
    UploadChunk {
        file_name: String,
        total_size: u64,
        offset: u64,
        file_key: Option<String>,
        bytes: Vec<u8>,
    },
    UploadFinalize {
        file_name: String,
        file_key: String,
        text: String,
        summary: String,
    },
}

/// Classified result of one mutating call. Expected remote-side rejections
/// never surface as errors; they land in one of the failure variants and the
/// dispatcher decides what to do with them.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Success(Value),
    RetryableFailure(String),
    FatalFailure(String),
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

enum Classified {
    Success(Value),
    TokenRejected(String),
    Retryable(String),
    Fatal(String),
}

impl Classified {
    fn into_outcome(self) -> ActionOutcome {
        match self {
            Self::Success(payload) => ActionOutcome::Success(payload),
            Self::TokenRejected(cause) | Self::Fatal(cause) => ActionOutcome::FatalFailure(cause),
            Self::Retryable(cause) => ActionOutcome::RetryableFailure(cause),
        }
    }
}

struct TokenState {
    value: Option<String>,
    generation: u64,
}

/// Authenticated identity, write token, and transport handle. Owned by one
/// ActionClient; dispatcher workers borrow it through `&ActionClient`.
pub struct Session {
    transport: Box<dyn Transport>,
    identity: Option<String>,
    token: Mutex<TokenState>,
}

impl Session {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            identity: None,
            token: Mutex::new(TokenState {
                value: None,
                generation: 0,
            }),
        }
    }

    fn token_state(&self) -> MutexGuard<'_, TokenState> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ActionClient {
    session: Session,
    maxlag_seconds: Option<u64>,
}

impl ActionClient {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(transport),
            maxlag_seconds: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        let maxlag_seconds = (config.maxlag_seconds > 0).then_some(config.maxlag_seconds);
        Ok(Self {
            session: Session::new(Box::new(transport)),
            maxlag_seconds,
        })
    }

    pub fn identity(&self) -> Option<&str> {
        self.session.identity.as_deref()
    }

    /// Authenticate against the remote wiki. Resets the write token so the
    /// next mutating call fetches one under the new identity.
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.send_checked(&ApiRequest::get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ]))?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.logintoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.send_checked(&ApiRequest::post(&[
            ("action", "login".to_string()),
            ("lgname", username.to_string()),
            ("lgpassword", password.to_string()),
            ("lgtoken", login_token),
        ]))?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                let mut state = self.session.token_state();
                state.value = None;
                state.generation += 1;
                drop(state);
                self.session.identity = Some(username.to_string());
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    /// Issue one mutating call: attach the current write token, classify the
    /// response, and replay exactly once after a coalesced token renewal.
    pub fn execute(&self, action: &WriteAction) -> ActionOutcome {
        let (token, generation) = match self.current_token() {
            Ok(pair) => pair,
            Err(outcome) => return outcome,
        };
        match self.attempt(action, &token) {
            Classified::TokenRejected(_) => {
                let renewed = match self.renew_token(generation) {
                    Ok(token) => token,
                    Err(outcome) => return outcome,
                };
                match self.attempt(action, &renewed) {
                    Classified::TokenRejected(cause) => ActionOutcome::FatalFailure(format!(
                        "write token rejected again after renewal: {cause}"
                    )),
                    other => other.into_outcome(),
                }
            }
            other => other.into_outcome(),
        }
    }

    fn attempt(&self, action: &WriteAction, token: &str) -> Classified {
        let request = self.action_request(action, token);
        let response = match self.session.transport.send(&request) {
            Ok(response) => response,
            Err(failure) if failure.retryable => return Classified::Retryable(failure.message),
            Err(failure) => return Classified::Fatal(failure.message),
        };
        classify_response(response)
    }

    fn action_request(&self, action: &WriteAction, token: &str) -> ApiRequest {
        match action {
            WriteAction::Edit {
                title,
                text,
                summary,
                mode,
            } => {
                let text_param = match mode {
                    EditMode::Replace => "text",
                    EditMode::Prepend => "prependtext",
                    EditMode::Append => "appendtext",
                };
                let mut params = vec![
                    ("action", "edit".to_string()),
                    ("title", title.text().to_string()),
                    (text_param, text.clone()),
                    ("summary", summary.clone()),
                    ("bot", "1".to_string()),
                    ("token", token.to_string()),
                ];
                self.push_maxlag(&mut params);
                ApiRequest::post(&params)
            }
            WriteAction::Delete { title, reason } => {
                let mut params = vec![
                    ("action", "delete".to_string()),
                    ("title", title.text().to_string()),
                    ("reason", reason.clone()),
                    ("token", token.to_string()),
                ];
                self.push_maxlag(&mut params);
                ApiRequest::post(&params)
            }
            WriteAction::Move { from, to, reason } => {
                let mut params = vec![
                    ("action", "move".to_string()),
                    ("from", from.text().to_string()),
                    ("to", to.text().to_string()),
                    ("reason", reason.clone()),
                    ("movetalk", "1".to_string()),
                    ("token", token.to_string()),
                ];
                self.push_maxlag(&mut params);
                ApiRequest::post(&params)
            }
            WriteAction::Purge { titles } => {
                let joined = titles
                    .iter()
                    .map(Title::text)
                    .collect::<Vec<_>>()
                    .join("|");
                let mut params = vec![
                    ("action", "purge".to_string()),
                    ("titles", joined),
                    ("token", token.to_string()),
                ];
                self.push_maxlag(&mut params);
                ApiRequest::post(&params)
            }
            WriteAction::UploadChunk {
                file_name,
                total_size,
                offset,
                file_key,
                bytes,
            } => {
                let mut params = vec![
                    ("action", "upload".to_string()),
                    ("stash", "1".to_string()),
                    ("filename", file_name.clone()),
                    ("filesize", total_size.to_string()),
                    ("offset", offset.to_string()),
                    ("ignorewarnings", "1".to_string()),
                    ("token", token.to_string()),
                ];
                if let Some(key) = file_key {
                    params.push(("filekey", key.clone()));
                }
                self.push_maxlag(&mut params);
                ApiRequest::post(&params).with_file("chunk", file_name, bytes.clone())
            }
            WriteAction::UploadFinalize {
                file_name,
                file_key,
                text,
                summary,
            } => {
                let mut params = vec![
                    ("action", "upload".to_string()),
                    ("filename", file_name.clone()),
                    ("filekey", file_key.clone()),
                    ("text", text.clone()),
                    ("comment", summary.clone()),
                    ("ignorewarnings", "1".to_string()),
                    ("token", token.to_string()),
                ];
                self.push_maxlag(&mut params);
                ApiRequest::post(&params)
            }
        }
    }

    fn push_maxlag(&self, params: &mut Vec<(&str, String)>) {
        if let Some(seconds) = self.maxlag_seconds {
            params.push(("maxlag", seconds.to_string()));
        }
    }

    fn current_token(&self) -> Result<(String, u64), ActionOutcome> {
        let mut state = self.session.token_state();
        if let Some(value) = &state.value {
            return Ok((value.clone(), state.generation));
        }
        let fetched = self.fetch_write_token()?;
        state.value = Some(fetched.clone());
        state.generation += 1;
        Ok((fetched, state.generation))
    }

    /// Renew the write token under the session critical section. Racing
    /// workers coalesce: only the caller that still observes the generation
    /// it read issues a network fetch, the rest reuse the renewed token.
    fn renew_token(&self, observed_generation: u64) -> Result<String, ActionOutcome> {
        let mut state = self.session.token_state();
        if state.generation != observed_generation
            && let Some(value) = &state.value
        {
            return Ok(value.clone());
        }
        let fetched = self.fetch_write_token()?;
        state.value = Some(fetched.clone());
        state.generation += 1;
        Ok(fetched)
    }

    fn fetch_write_token(&self) -> Result<String, ActionOutcome> {
        let request = ApiRequest::get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ]);
        let response = match self.session.transport.send(&request) {
            Ok(response) => response,
            Err(failure) if failure.retryable => {
                return Err(ActionOutcome::RetryableFailure(failure.message));
            }
            Err(failure) => return Err(ActionOutcome::FatalFailure(failure.message)),
        };
        if !response.status.is_success() {
            let cause = format!(
                "MediaWiki API request failed with HTTP {}",
                response.status
            );
            return Err(if is_retryable_status(response.status) {
                ActionOutcome::RetryableFailure(cause)
            } else {
                ActionOutcome::FatalFailure(cause)
            });
        }
        let parsed: TokenQueryResponse = match serde_json::from_value(response.body) {
            Ok(parsed) => parsed,
            Err(error) => {
                return Err(ActionOutcome::FatalFailure(format!(
                    "failed to decode csrf token response: {error}"
                )));
            }
        };
        parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ActionOutcome::FatalFailure("failed to get MediaWiki csrf token".to_string())
            })
    }

    /// Transport call for setup requests where a failure aborts the run
    /// instead of being classified per item.
    fn send_checked(&self, request: &ApiRequest) -> Result<Value> {
        let response = self.session.transport.send(request)?;
        if !response.status.is_success() {
            bail!(
                "MediaWiki API request failed with HTTP {}",
                response.status
            );
        }
        if let Some(error) = response.body.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let info = error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or("unknown info");
            bail!("MediaWiki API error [{code}]: {info}");
        }
        Ok(response.body)
    }
}

fn classify_response(response: ApiResponse) -> Classified {
    if !response.status.is_success() {
        let cause = format!(
            "MediaWiki API request failed with HTTP {}",
            response.status
        );
        return if is_retryable_status(response.status) {
            Classified::Retryable(cause)
        } else {
            Classified::Fatal(cause)
        };
    }
    if let Some(error) = response.body.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        let cause = format!("MediaWiki API error [{code}]: {info}");
        return match code {
            "badtoken" | "notoken" => Classified::TokenRejected(cause),
            _ if is_retryable_code(code) => Classified::Retryable(cause),
            _ => Classified::Fatal(cause),
        };
    }
    if let Some(cause) = rejected_module_result(&response.body) {
        return Classified::Fatal(cause);
    }
    Classified::Success(response.body)
}

fn is_retryable_code(code: &str) -> bool {
    matches!(code, "ratelimited" | "maxlag" | "readonly")
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Some modules report failure through a result string instead of a
/// top-level error object.
fn rejected_module_result(body: &Value) -> Option<String> {
    if let Some(result) = body
        .get("edit")
        .and_then(|edit| edit.get("result"))
        .and_then(Value::as_str)
        && result != "Success"
    {
        return Some(format!("MediaWiki edit failed: {result}"));
    }
    if let Some(result) = body
        .get("upload")
        .and_then(|upload| upload.get("result"))
        .and_then(Value::as_str)
        && !matches!(result, "Success" | "Continue")
    {
        return Some(format!("MediaWiki upload failed: {result}"));
    }
    None
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}
