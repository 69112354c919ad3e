use crate::error::{ErrorKind, PipelineError};
use serde::Serialize;
use serde_json::{Value, json};

/// The one terminal result a request produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Response {
    Ok {
        status: u16,
        body: Value,
    },
    Error {
        kind: ErrorKind,
        status: u16,
        detail: String,
    },
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Response::Ok { status: 200, body }
    }

    pub fn created(body: Value) -> Self {
        Response::Ok { status: 201, body }
    }

    /// Error response for `error`. Internal failures get a generic detail so
    /// panic messages never reach the client.
    pub fn from_error(error: &PipelineError) -> Self {
        let kind = error.kind();
        let detail = match kind {
            ErrorKind::Internal => "internal server error".to_string(),
            _ => error.to_string(),
        };
        Response::Error {
            kind,
            status: kind.status(),
            detail,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Response::Ok { status, .. } | Response::Error { status, .. } => *status,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Response::Ok { .. } => None,
            Response::Error { kind, .. } => Some(*kind),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// JSON body as written to the wire. A not-found error is the empty
    /// object, matching what clients of the list endpoints expect.
    pub fn body(&self) -> Value {
        match self {
            Response::Ok { body, .. } => body.clone(),
            Response::Error {
                kind: ErrorKind::NotFound,
                ..
            } => json!({}),
            Response::Error { kind, detail, .. } => json!({
                "error": kind.as_str(),
                "message": detail,
            }),
        }
    }
}
