//! Document codec contract and its CBOR implementation.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{Envelope, StatusRecord};
use crate::value::{from_bytes, map, to_bytes, Fields};
use ciborium::value::Value;

/// Serializes outbound content trees and parses inbound response bodies.
///
/// The engine calls `serialize` exactly once per request, when the request
/// is submitted, and `parse` once per completed request.
pub trait DocumentCodec: Send + Sync {
    /// Serializes an envelope to its wire form.
    fn serialize(&self, envelope: &Envelope) -> ProtocolResult<Vec<u8>>;

    /// Parses a raw response body into status records.
    fn parse(&self, raw: &[u8]) -> ProtocolResult<Vec<StatusRecord>>;
}

/// CBOR document codec.
///
/// Requests are a map with `message_id`, `protocol_version`, and an
/// `elements` array. Responses are a map with a `statuses` array.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl CborCodec {
    /// Creates a new CBOR codec.
    pub fn new() -> Self {
        Self
    }

    /// Decodes a request body. Used by servers and test doubles.
    pub fn decode_envelope(&self, raw: &[u8]) -> ProtocolResult<Envelope> {
        Envelope::from_value(&from_bytes(raw)?)
    }

    /// Encodes a response body. Used by servers and test doubles.
    pub fn encode_statuses(&self, statuses: &[StatusRecord]) -> ProtocolResult<Vec<u8>> {
        to_bytes(&map(vec![(
            "statuses",
            Value::Array(statuses.iter().map(StatusRecord::to_value).collect()),
        )]))
    }
}

impl DocumentCodec for CborCodec {
    fn serialize(&self, envelope: &Envelope) -> ProtocolResult<Vec<u8>> {
        to_bytes(&envelope.to_value())
    }

    fn parse(&self, raw: &[u8]) -> ProtocolResult<Vec<StatusRecord>> {
        if raw.is_empty() {
            return Err(ProtocolError::decoding_failed("empty response body"));
        }
        let value = from_bytes(raw)?;
        let fields = Fields::of(&value, "response")?;
        match fields.get("statuses") {
            Some(_) => fields
                .array("statuses")?
                .iter()
                .map(StatusRecord::from_value)
                .collect(),
            None => Ok(Vec::new()),
        }
    }
}
