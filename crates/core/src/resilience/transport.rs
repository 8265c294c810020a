use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub timeout: Duration,
    pub body: Option<Value>,
    pub bearer_token: Option<SecretString>,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self { method: Method::Get, url: url.into(), timeout, body: None, bearer_token: None }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("upstream returned status {status}")]
    Status { status: u16, body: Option<String> },
    #[error("response body could not be decoded: {0}")]
    Decode(String),
}

impl TransportError {
    /// Timeouts, connection failures, throttling and upstream 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connect(_) => true,
            Self::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::Decode(_) => false,
        }
    }
}

/// Outbound HTTP seam. The server wires a reqwest-backed implementation; tests script one.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

type Outcome = Result<TransportResponse, TransportError>;

#[derive(Debug)]
struct Route {
    url_fragment: String,
    outcomes: VecDeque<Outcome>,
}

/// Transport answering from queued outcomes matched by URL fragment. The last queued
/// outcome of a route repeats once the others are used up.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url_fragment: &str, status: u16, body: Value) -> Self {
        self.push(url_fragment, Ok(TransportResponse { status, body }));
        self
    }

    pub fn fail(self, url_fragment: &str, error: TransportError) -> Self {
        self.push(url_fragment, Err(error));
        self
    }

    pub fn push(&self, url_fragment: &str, outcome: Outcome) {
        let mut routes = match self.routes.lock() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(route) = routes.iter_mut().find(|route| route.url_fragment == url_fragment) {
            route.outcomes.push_back(outcome);
        } else {
            routes.push(Route {
                url_fragment: url_fragment.to_string(),
                outcomes: VecDeque::from([outcome]),
            });
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_matching(&self, url_fragment: &str) -> usize {
        let requested = match self.requested.lock() {
            Ok(requested) => requested,
            Err(poisoned) => poisoned.into_inner(),
        };
        requested.iter().filter(|url| url.contains(url_fragment)).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn call(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.requested.lock() {
            Ok(mut requested) => requested.push(request.url.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.url.clone()),
        }

        let mut routes = match self.routes.lock() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        let route = routes.iter_mut().find(|route| request.url.contains(&route.url_fragment));
        match route {
            Some(route) if route.outcomes.len() > 1 => route
                .outcomes
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("route drained".to_string()))),
            Some(route) => route
                .outcomes
                .front()
                .cloned()
                .unwrap_or_else(|| Err(TransportError::Connect("route drained".to_string()))),
            None => Err(TransportError::Connect(format!("no route for {}", request.url))),
        }
    }
}
