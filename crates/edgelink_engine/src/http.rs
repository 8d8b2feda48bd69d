//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so that different
//! implementations (blocking clients, embedded stacks, in-process servers)
//! can drive the engine. Requests are queued on submit and executed inside
//! [`Transport::wait_for_events`], which keeps the engine's only blocking
//! point inside the caller-supplied bound.

use crate::error::{EngineError, EngineResult};
use crate::transport::{OutboundRequest, Transport, TransportEvent};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Size of the body chunks reported to the engine.
const CHUNK_SIZE: usize = 4096;

/// Blocking client used by [`HttpTransport`] to post encoded messages.
pub trait HttpClient: Send {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// False when the client knows the network is down, so submissions fail fast.
    fn is_healthy(&self) -> bool;
}

/// Adapts a blocking [`HttpClient`] to the submit/wait transport contract.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    pending: VecDeque<OutboundRequest>,
    last_error: Option<String>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(client: C) -> Self {
        Self {
            client,
            pending: VecDeque::new(),
            last_error: None,
        }
    }

    /// Returns the client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn execute(&mut self, request: OutboundRequest, events: &mut Vec<TransportEvent>) {
        let request_id = request.request_id;
        if !self.client.is_healthy() {
            self.last_error = Some("client unavailable".into());
            events.push(TransportEvent::Error {
                request_id,
                error: EngineError::transport_retryable("client unavailable"),
            });
            return;
        }

        debug!("POST {} ({} bytes, message {request_id})", request.url, request.body.len());
        match self.client.post(&request.url, request.body) {
            Ok(body) => {
                self.last_error = None;
                for (index, chunk) in body.chunks(CHUNK_SIZE).enumerate() {
                    events.push(TransportEvent::BodyChunk {
                        request_id,
                        offset: index * CHUNK_SIZE,
                        bytes: chunk.to_vec(),
                    });
                }
                events.push(TransportEvent::Completed { request_id });
            }
            Err(e) => {
                events.push(TransportEvent::Error {
                    request_id,
                    error: EngineError::transport_retryable(e.as_str()),
                });
                self.last_error = Some(e);
            }
        }
    }
}

impl<C: HttpClient> Transport for HttpTransport<C> {
    fn submit(&mut self, requests: Vec<OutboundRequest>) {
        self.pending.extend(requests);
    }

    fn has_pending_work(&self) -> bool {
        !self.pending.is_empty()
    }

    fn wait_for_events(&mut self, timeout: Duration) -> EngineResult<Vec<TransportEvent>> {
        let started = Instant::now();
        let mut events = Vec::new();
        // At least one exchange per wait, even with a zero bound.
        while let Some(request) = self.pending.pop_front() {
            self.execute(request, &mut events);
            if started.elapsed() >= timeout {
                break;
            }
        }
        Ok(events)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

/// A loopback HTTP client that routes requests directly to an in-process server.
///
/// Useful for testing and simulation without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer + Send> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        self.server.handle_post(url, &body)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
