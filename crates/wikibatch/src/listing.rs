use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use wikibatch_core::transport::{ApiRequest, Transport};

/// List every member of a category, following API continuation. This is the
/// read-only collaborator that produces delete lists; the core itself only
/// consumes the resulting titles.
pub fn category_members(transport: &dyn Transport, category: &str) -> Result<Vec<String>> {
    let category_title = if category.starts_with("Category:") {
        category.to_string()
    } else {
        format!("Category:{category}")
    };

    let mut titles = Vec::new();
    let mut continue_token: Option<String> = None;
    loop {
        let mut params = vec![
            ("action", "query".to_string()),
            ("list", "categorymembers".to_string()),
            ("cmtitle", category_title.clone()),
            ("cmlimit", "500".to_string()),
        ];
        if let Some(token) = &continue_token {
            params.push(("cmcontinue", token.clone()));
        }

        let response = transport.send(&ApiRequest::get(&params))?;
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

        let parsed: QueryResponse = serde_json::from_value(response.body)
            .context("failed to decode categorymembers API response")?;
        for item in parsed.query.categorymembers {
            titles.push(item.title);
        }
        continue_token = parsed.continuation.and_then(|cont| cont.cmcontinue);
        if continue_token.is_none() {
            break;
        }
    }

    Ok(titles)
}

/// Read titles from a text file, one per line. Blank lines and lines
/// starting with `#` are skipped.
pub fn read_titles_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    categorymembers: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}
