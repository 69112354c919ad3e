//! Request scripts: one request per line.
//!
//! ```text
//! # comment
//! POST /lists {"description": "Weekly"}
//! @25 GET /lists/1
//! ```
//!
//! A leading `@<ms>` delivers the request from a timer instead of as an
//! immediate I/O event.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script line {line}: {message}")]
pub struct ScriptError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedRequest {
    pub line: usize,
    pub delay_ms: Option<u64>,
    pub method: String,
    pub target: String,
    pub body: Option<Value>,
}

pub fn parse(text: &str) -> Result<Vec<ScriptedRequest>, ScriptError> {
    let mut requests = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        requests.push(parse_line(line, trimmed)?);
    }
    Ok(requests)
}

fn parse_line(line: usize, text: &str) -> Result<ScriptedRequest, ScriptError> {
    let error = |message: String| ScriptError { line, message };

    let (delay_ms, rest) = match text.strip_prefix('@') {
        Some(timed) => {
            let (delay, rest) = timed
                .split_once(char::is_whitespace)
                .ok_or_else(|| error("expected a request after the delay".into()))?;
            let delay = delay
                .parse::<u64>()
                .map_err(|_| error(format!("bad delay `{delay}`")))?;
            (Some(delay), rest.trim_start())
        }
        None => (None, text),
    };

    let mut parts = rest.splitn(3, char::is_whitespace);
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| error("missing method".into()))?;
    let target = parts
        .next()
        .filter(|t| t.starts_with('/'))
        .ok_or_else(|| error("missing target path".into()))?;
    let body = match parts.next().map(str::trim).filter(|b| !b.is_empty()) {
        Some(json) => Some(
            serde_json::from_str(json).map_err(|e| error(format!("bad JSON body: {e}")))?,
        ),
        None => None,
    };

    Ok(ScriptedRequest {
        line,
        delay_ms,
        method: method.to_string(),
        target: target.to_string(),
        body,
    })
}
