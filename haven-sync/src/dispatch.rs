//! Mutation dispatch.
//!
//! The orchestrator hands each queued operation to a [`MutationDispatcher`].
//! [`HttpDispatcher`] is the production implementation; [`mock`] provides a
//! scripted dispatcher for tests.

use crate::config::HttpMethod;
use crate::error::DispatchError;
use async_trait::async_trait;
use haven_types::{OperationId, OperationKind};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One request to send.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub id: OperationId,
    pub kind: OperationKind,
    pub method: HttpMethod,
    /// Resolved path below the base URL.
    pub path: String,
    pub body: Value,
}

/// What the server did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Accepted. Carries the server's record when it returned one.
    Applied { server: Option<Value> },
    /// The server holds a diverging version of the record.
    Conflict { server: Value },
}

/// Sends queued mutations to the backend.
#[async_trait]
pub trait MutationDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, DispatchError>;
}

/// Supplies a bearer token for each request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

/// JSON-over-HTTP dispatcher.
///
/// 2xx applies, 409 reports a conflict with the body as the server record,
/// and every other status is returned as [`DispatchError::Status`].
pub struct HttpDispatcher {
    client: Client,
    base_url: String,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl HttpDispatcher {
    /// Creates a dispatcher with its own client.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens: None,
        }
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Network(e.to_string())
    }
}

#[async_trait]
impl MutationDispatcher for HttpDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        let mut builder = self
            .client
            .request(request.method.into(), self.url(&request.path))
            .header("Idempotency-Key", request.id.to_string())
            .json(&request.body);
        if let Some(tokens) = &self.tokens
            && let Some(token) = tokens.bearer_token().await
        {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(op_id = %request.id, status = status.as_u16(), "dispatch response");

        if status.is_success() {
            let body = response.bytes().await.map_err(transport_error)?;
            if body.is_empty() {
                return Ok(DispatchOutcome::Applied { server: None });
            }
            // Non-JSON success bodies are accepted without a server record.
            let server = serde_json::from_slice(&body).ok();
            return Ok(DispatchOutcome::Applied { server });
        }

        if status == StatusCode::CONFLICT {
            let body = response.bytes().await.map_err(transport_error)?;
            let server = serde_json::from_slice(&body)?;
            return Ok(DispatchOutcome::Conflict { server });
        }

        Err(DispatchError::Status(status.as_u16()))
    }
}

/// A scripted dispatcher for testing.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// One scripted reply.
    #[derive(Debug, Clone, PartialEq)]
    pub enum MockResponse {
        Applied(Option<Value>),
        Conflict(Value),
        Status(u16),
        NetworkDown,
        Timeout,
    }

    impl MockResponse {
        fn into_result(self) -> Result<DispatchOutcome, DispatchError> {
            match self {
                Self::Applied(server) => Ok(DispatchOutcome::Applied { server }),
                Self::Conflict(server) => Ok(DispatchOutcome::Conflict { server }),
                Self::Status(status) => Err(DispatchError::Status(status)),
                Self::NetworkDown => Err(DispatchError::Network("connection reset".into())),
                Self::Timeout => Err(DispatchError::Timeout),
            }
        }
    }

    /// Replies from per-kind scripts, falling back to a default reply.
    #[derive(Debug)]
    pub struct MockDispatcher {
        default: Mutex<MockResponse>,
        scripts: Mutex<HashMap<OperationKind, VecDeque<MockResponse>>>,
        calls: Mutex<Vec<DispatchRequest>>,
        latency: Mutex<Option<Duration>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockDispatcher {
        /// A dispatcher that applies everything.
        pub fn new() -> Self {
            Self {
                default: Mutex::new(MockResponse::Applied(None)),
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                latency: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn set_default(&self, response: MockResponse) {
            *self.default.lock().unwrap_or_else(PoisonError::into_inner) = response;
        }

        /// Queues a one-shot reply for the next request of `kind`.
        pub fn push_response(&self, kind: OperationKind, response: MockResponse) {
            self.scripts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(kind)
                .or_default()
                .push_back(response);
        }

        /// Delays every reply (uses tokio time, so paused clocks apply).
        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
        }

        pub fn calls(&self) -> Vec<DispatchRequest> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        /// Highest number of requests ever in flight at once.
        pub fn max_concurrency(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn next_response(&self, kind: OperationKind) -> MockResponse {
            let scripted = self
                .scripts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(&kind)
                .and_then(VecDeque::pop_front);
            scripted.unwrap_or_else(|| {
                self.default
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
        }
    }

    impl Default for MockDispatcher {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl MutationDispatcher for MockDispatcher {
        async fn dispatch(
            &self,
            request: DispatchRequest,
        ) -> Result<DispatchOutcome, DispatchError> {
            let kind = request.kind;
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.next_response(kind).into_result()
        }
    }
}
