//! Outbound message lifecycle.
//!
//! Each server location has at most one pending [`Request`]. A request
//! collects content elements while `Open`, is serialized exactly once when
//! `Sealed`, travels through the transport while `Active`, and ends
//! `Completed` with either a response body or an error. A failed request is
//! reset to `Open` with its elements intact so they are resent.

use crate::error::{EngineError, EngineResult};
use crate::model::{ConfigId, DeviceId, LocationId};
use edgelink_protocol::{ContentElement, DocumentCodec, ElementKind, Envelope, StatusRecord};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

/// Estimated envelope framing, charged before any element is added.
const ENVELOPE_OVERHEAD: usize = 24;

/// Upper bound on an accumulated response body.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Accepting content.
    Open,
    /// Serialized, not yet handed to the transport.
    Sealed,
    /// Submitted to the transport.
    Active,
    /// The transport reported completion or an error.
    Completed,
}

/// Transport preferences taken from the server configuration that opened
/// the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Protocol version.
    pub protocol_version: u16,
    /// Keep the connection open after the exchange.
    pub persistent: bool,
    /// Transport-enforced timeout.
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            protocol_version: edgelink_protocol::PROTOCOL_VERSION,
            persistent: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A content element together with the binding it was produced for.
#[derive(Debug, Clone)]
pub struct RequestElement {
    /// Configuration of the binding.
    pub config: ConfigId,
    /// Device of the binding.
    pub device: DeviceId,
    /// The element itself.
    pub element: ContentElement,
}

/// One outbound message bound to a server location.
#[derive(Debug)]
pub struct Request {
    id: u64,
    location: LocationId,
    state: RequestState,
    elements: Vec<RequestElement>,
    estimated_size: usize,
    max_size: usize,
    options: TransportOptions,
    outbound: Vec<u8>,
    inbound: Vec<u8>,
    statuses: Vec<StatusRecord>,
    error: Option<EngineError>,
}

impl Request {
    /// Creates an empty, open request.
    pub fn new(id: u64, location: LocationId, options: TransportOptions, max_size: usize) -> Self {
        Self {
            id,
            location,
            state: RequestState::Open,
            elements: Vec::new(),
            estimated_size: ENVELOPE_OVERHEAD,
            max_size,
            options,
            outbound: Vec::new(),
            inbound: Vec::new(),
            statuses: Vec::new(),
            error: None,
        }
    }

    /// Message ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target location.
    pub fn location(&self) -> LocationId {
        self.location
    }

    /// Lifecycle state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Accumulated elements.
    pub fn elements(&self) -> &[RequestElement] {
        &self.elements
    }

    /// Returns true if nothing was added yet.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Estimated serialized size.
    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    /// Transport preferences.
    pub fn options(&self) -> TransportOptions {
        self.options
    }

    /// Serialized body. Empty until sealed.
    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    /// Response body received so far.
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    /// Parsed status records.
    pub fn statuses(&self) -> &[StatusRecord] {
        &self.statuses
    }

    /// Error reported by the transport, if any.
    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    /// Adds an element if the request is open and has room.
    ///
    /// The first element is always accepted so that an oversized item can
    /// still be sent on its own.
    pub fn push(&mut self, config: ConfigId, device: DeviceId, element: ContentElement) -> bool {
        if self.state != RequestState::Open {
            return false;
        }
        let size = element.size_hint();
        if !self.elements.is_empty() && self.estimated_size + size > self.max_size {
            return false;
        }
        self.estimated_size += size;
        self.elements.push(RequestElement {
            config,
            device,
            element,
        });
        true
    }

    /// Returns true if an element of `kind` for this binding is present.
    pub fn has_element(&self, config: ConfigId, device: DeviceId, kind: ElementKind) -> bool {
        self.elements
            .iter()
            .any(|e| e.config == config && e.device == device && e.element.kind() == kind)
    }

    /// Returns true if the request carries a registration for this binding.
    pub fn registers(&self, config: ConfigId, device: DeviceId) -> bool {
        self.has_element(config, device, ElementKind::Registration)
    }

    /// Serializes the accumulated content. Only valid while open.
    pub fn seal(&mut self, codec: &dyn DocumentCodec) -> EngineResult<()> {
        if self.state != RequestState::Open {
            return Ok(());
        }
        let envelope = Envelope {
            message_id: self.id,
            protocol_version: self.options.protocol_version,
            elements: self.elements.iter().map(|e| e.element.clone()).collect(),
        };
        self.outbound = codec.serialize(&envelope)?;
        self.state = RequestState::Sealed;
        Ok(())
    }

    /// Marks the request as handed to the transport.
    pub fn activate(&mut self) {
        self.state = RequestState::Active;
    }

    /// Stores a chunk of the response body at `offset`.
    pub fn on_body_chunk(&mut self, offset: usize, bytes: &[u8]) -> EngineResult<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= MAX_RESPONSE_SIZE)
            .ok_or_else(|| {
                EngineError::ResourceExhausted(format!(
                    "response body for message {} exceeds {} bytes",
                    self.id, MAX_RESPONSE_SIZE
                ))
            })?;
        if self.inbound.len() < end {
            self.inbound.resize(end, 0);
        }
        self.inbound[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Marks the exchange as finished.
    pub fn on_completed(&mut self) {
        self.state = RequestState::Completed;
    }

    /// Marks the exchange as failed.
    pub fn on_error(&mut self, error: EngineError) {
        self.error = Some(error);
        self.state = RequestState::Completed;
    }

    /// Parses the response body into status records.
    pub fn parse_response(&mut self, codec: &dyn DocumentCodec) -> EngineResult<&[StatusRecord]> {
        self.statuses = codec.parse(&self.inbound)?;
        Ok(&self.statuses)
    }

    pub(crate) fn take_statuses(&mut self) -> Vec<StatusRecord> {
        std::mem::take(&mut self.statuses)
    }

    pub(crate) fn take_error(&mut self) -> Option<EngineError> {
        self.error.take()
    }

    /// Returns to `Open`, keeping elements and message ID. Serialized
    /// output, response body, statuses and error are discarded.
    pub fn reset(&mut self) {
        self.state = RequestState::Open;
        self.outbound.clear();
        self.inbound.clear();
        self.statuses.clear();
        self.error = None;
    }
}

/// Pending requests, one per location at most.
#[derive(Debug)]
pub struct RequestTable {
    requests: BTreeMap<LocationId, Request>,
    next_id: u64,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Returns the open request for `location`, creating one if none is
    /// pending. Returns `None` while the pending request is sealed or in
    /// flight.
    pub fn open(
        &mut self,
        location: LocationId,
        options: TransportOptions,
        max_size: usize,
    ) -> Option<&mut Request> {
        match self.requests.entry(location) {
            Entry::Occupied(entry) => {
                let request = entry.into_mut();
                (request.state == RequestState::Open).then_some(request)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id;
                self.next_id += 1;
                Some(entry.insert(Request::new(id, location, options, max_size)))
            }
        }
    }

    /// Pending request for a location.
    pub fn get(&self, location: LocationId) -> Option<&Request> {
        self.requests.get(&location)
    }

    pub(crate) fn get_mut(&mut self, location: LocationId) -> Option<&mut Request> {
        self.requests.get_mut(&location)
    }

    /// Location of the request with this message ID.
    pub fn find_by_id(&self, id: u64) -> Option<LocationId> {
        self.requests
            .values()
            .find(|r| r.id == id)
            .map(|r| r.location)
    }

    /// Returns true if a request with this message ID is pending.
    pub fn is_live(&self, id: u64) -> bool {
        self.requests.values().any(|r| r.id == id)
    }

    /// Detaches the request for a location.
    pub fn remove(&mut self, location: LocationId) -> Option<Request> {
        self.requests.remove(&location)
    }

    /// Reattaches a request to its location.
    pub fn insert(&mut self, request: Request) {
        self.requests.insert(request.location, request);
    }

    /// Locations whose request is open and has content.
    pub fn ready_locations(&self) -> Vec<LocationId> {
        self.requests
            .values()
            .filter(|r| r.state == RequestState::Open && !r.is_empty())
            .map(|r| r.location)
            .collect()
    }

    /// Number of requests currently with the transport.
    pub fn active_count(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.state == RequestState::Active)
            .count()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if no request is pending.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
