use crate::error::PipelineError;
use crate::response::Response;
use crate::service::Command;
use cadence_scheduler::{EventLoop, WeakLoop};
use rustc_hash::FxHashMap;
use serde_json::Value;
use smallvec::SmallVec;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Other(String),
}

impl Method {
    /// Case-insensitive; anything unrecognised becomes `Other`.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            _ => Method::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared cancellation flag for one request. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.get()
    }
}

/// One-shot sink for a request's terminal response.
///
/// If it is dropped unsent while its loop is still alive (the request's
/// continuation was lost, e.g. to a panic in the code that should have
/// settled it), a generic internal error is delivered from the next I/O
/// phase instead.
pub struct Responder {
    send: Option<Box<dyn FnOnce(&EventLoop, Response)>>,
    owner: Option<WeakLoop>,
}

impl Responder {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&EventLoop, Response) + 'static,
    {
        Self {
            send: Some(Box::new(f)),
            owner: None,
        }
    }

    fn bind(&mut self, lp: &EventLoop) {
        self.owner = Some(lp.downgrade());
    }

    fn send(mut self, lp: &EventLoop, response: Response) {
        if let Some(send) = self.send.take() {
            send(lp, response);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        let Some(send) = self.send.take() else {
            return;
        };
        match self.owner.as_ref().and_then(WeakLoop::upgrade) {
            Some(lp) => {
                tracing::error!("request dropped without a response");
                let response = Response::from_error(&PipelineError::Internal(
                    "request dropped without a response".into(),
                ));
                lp.enqueue_io(move |lp| send(lp, response));
            }
            None => tracing::warn!("request dropped without a response and no loop to answer from"),
        }
    }
}

/// Per-request state, owned by exactly one pipeline run.
///
/// Responding consumes the context, so a request can only ever be
/// answered once.
pub struct Context {
    pub id: u64,
    pub method: Method,
    /// Path without the query string.
    pub path: String,
    pub segments: SmallVec<[String; 4]>,
    pub query: FxHashMap<String, String>,
    pub body: Option<Value>,
    /// Set once the request has been validated.
    pub command: Option<Command>,
    outputs: Vec<(&'static str, Value)>,
    cancel: CancelToken,
    responder: Responder,
}

impl Context {
    pub fn new(
        id: u64,
        method: Method,
        target: &str,
        body: Option<Value>,
        responder: Responder,
    ) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, FxHashMap::default()),
        };
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(percent_decode)
            .collect();

        Self {
            id,
            method,
            path: path.to_string(),
            segments,
            query,
            body,
            command: None,
            outputs: Vec::new(),
            cancel: CancelToken::new(),
            responder,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Output recorded by the stage called `stage`, if it has produced one.
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .rev()
            .find(|(name, _)| *name == stage)
            .map(|(_, value)| value)
    }

    /// Ties the responder to `lp`, so a lost request is still answered.
    pub(crate) fn bind(&mut self, lp: &EventLoop) {
        self.responder.bind(lp);
    }

    pub(crate) fn record_output(&mut self, stage: &'static str, value: Value) {
        self.outputs.push((stage, value));
    }

    pub(crate) fn respond(self, lp: &EventLoop, response: Response) {
        self.responder.send(lp, response);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("command", &self.command)
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

fn parse_query(query: &str) -> FxHashMap<String, String> {
    let mut params = FxHashMap::default();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(key), percent_decode(value));
    }
    params
}

/// `+` becomes a space and `%XX` escapes are decoded; malformed escapes are
/// kept as written.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(target: &str) -> Context {
        Context::new(1, Method::Get, target, None, Responder::new(|_, _| {}))
    }

    #[test]
    fn test_target_split_into_segments_and_query() {
        let cx = context("/lists/7/items?description=whole+milk&upc=%2012");
        assert_eq!(cx.path, "/lists/7/items");
        assert_eq!(cx.segments.as_slice(), ["lists", "7", "items"]);
        assert_eq!(cx.query.get("description").map(String::as_str), Some("whole milk"));
        assert_eq!(cx.query.get("upc").map(String::as_str), Some(" 12"));
    }

    #[test]
    fn test_trailing_percent_is_kept() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("a%zzb"), "a%zzb");
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("get"), Method::Get);
        assert_eq!(Method::parse("BREW"), Method::Other("BREW".into()));
    }
}
