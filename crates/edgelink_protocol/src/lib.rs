//! # EdgeLink Protocol
//!
//! Wire types and the document codec for the EdgeLink M2M agent.
//!
//! This crate provides:
//! - `ContentElement` for the typed pieces of an outbound message
//! - `Envelope`, the content tree serialized once per request
//! - `StatusRecord` for parsed per-device or global server outcomes
//! - `ServerCommand` and `CommandStatus` for server-issued commands
//! - `DocumentCodec` with a CBOR implementation
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod element;
mod error;
mod messages;
mod value;

pub use codec::{CborCodec, DocumentCodec};
pub use element::{ContentElement, DeviceIdentity, ElementBody, ElementKind};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    CommandStatus, CommandStatusEcho, Envelope, ServerCommand, StatusCode, StatusRecord,
    StatusScope,
};

/// Protocol version sent when a server configuration does not override it.
pub const PROTOCOL_VERSION: u16 = 1;
