//! Transport contract consumed by the drive loop.
//!
//! The transport may use asynchronous I/O internally, but the engine only
//! sees a synchronous contract: submit a batch, then wait up to a bound for
//! completion events.

use crate::error::{EngineError, EngineResult};
use crate::request::TransportOptions;
use std::collections::VecDeque;
use std::time::Duration;

/// A serialized request handed to the transport.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Message ID; echoed in every event for this request.
    pub request_id: u64,
    /// Normalized target URL.
    pub url: String,
    /// Serialized body.
    pub body: Vec<u8>,
    /// Connection preferences.
    pub options: TransportOptions,
}

/// Progress reported by the transport for a submitted request.
#[derive(Debug)]
pub enum TransportEvent {
    /// The exchange failed.
    Error {
        /// Message ID.
        request_id: u64,
        /// What went wrong.
        error: EngineError,
    },
    /// Part of the response body arrived.
    BodyChunk {
        /// Message ID.
        request_id: u64,
        /// Position of `bytes` within the body.
        offset: usize,
        /// Body bytes.
        bytes: Vec<u8>,
    },
    /// The full response body was delivered.
    Completed {
        /// Message ID.
        request_id: u64,
    },
}

impl TransportEvent {
    /// Message ID the event refers to.
    pub fn request_id(&self) -> u64 {
        match self {
            TransportEvent::Error { request_id, .. }
            | TransportEvent::BodyChunk { request_id, .. }
            | TransportEvent::Completed { request_id } => *request_id,
        }
    }
}

/// Moves serialized requests to servers and reports their outcome.
pub trait Transport: Send {
    /// Starts the given requests. Never blocks on the network.
    fn submit(&mut self, requests: Vec<OutboundRequest>);

    /// Returns true while submitted requests have not produced their final event.
    fn has_pending_work(&self) -> bool;

    /// Blocks for at most `timeout` and returns the events that occurred.
    fn wait_for_events(&mut self, timeout: Duration) -> EngineResult<Vec<TransportEvent>>;
}

/// A scripted transport for testing.
///
/// Submitted requests are recorded; events are whatever the test pushed.
#[derive(Debug, Default)]
pub struct MockTransport {
    submitted: Vec<OutboundRequest>,
    events: VecDeque<TransportEvent>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for the next wait.
    pub fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    /// Requests submitted so far.
    pub fn submitted(&self) -> &[OutboundRequest] {
        &self.submitted
    }

    /// Takes the requests submitted so far.
    pub fn take_submitted(&mut self) -> Vec<OutboundRequest> {
        std::mem::take(&mut self.submitted)
    }
}

impl Transport for MockTransport {
    fn submit(&mut self, requests: Vec<OutboundRequest>) {
        self.submitted.extend(requests);
    }

    fn has_pending_work(&self) -> bool {
        !self.events.is_empty()
    }

    fn wait_for_events(&mut self, _timeout: Duration) -> EngineResult<Vec<TransportEvent>> {
        Ok(self.events.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_transport_records_and_replays() {
        let mut transport = MockTransport::new();
        transport.submit(vec![OutboundRequest {
            request_id: 4,
            url: "http://a/eMessage".into(),
            body: vec![1],
            options: TransportOptions::default(),
        }]);
        assert_eq!(transport.submitted().len(), 1);
        assert!(!transport.has_pending_work());

        transport.push_event(TransportEvent::Completed { request_id: 4 });
        assert!(transport.has_pending_work());
        let events = transport.wait_for_events(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id(), 4);
        assert!(!transport.has_pending_work());
        assert_eq!(transport.take_submitted().len(), 1);
        assert!(transport.submitted().is_empty());
    }
}
