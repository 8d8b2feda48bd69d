//! # EdgeLink Engine
//!
//! Synchronization core of the EdgeLink M2M agent.
//!
//! This crate provides:
//! - A bounded, priority-ordered outbound queue shared with producer threads
//! - Device, server-location and server-configuration registries
//! - Device-server bindings with registration, maintenance mode and
//!   reference-counted backup activation
//! - Control-message generation (registration, ping, online notice,
//!   maintenance ping, managed-device batch)
//! - Queue draining into one outbound request per server location
//! - Response processing and primary/backup failover
//! - The cyclic drive loop over a pluggable transport
//!
//! ## Architecture
//!
//! One [`Engine`] owns every registry as an arena; IDs are indices into
//! them. The drive loop runs on a single thread. Only the [`Queue`] is
//! shared: producers enqueue while the loop drains under the same lock.
//!
//! ## Key Invariants
//!
//! - At most one request per server location is in flight
//! - Queued items stay queued until a success status purges them
//! - A location goes offline only after the configured number of
//!   consecutive failures, and comes back on the first success
//! - Backup bindings are armed by a counter, never a flag

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod drainer;
mod endpoint;
mod engine;
mod error;
mod generator;
mod host;
mod http;
mod model;
mod queue;
mod request;
mod response;
mod transport;

pub use config::{
    EngineConfig, QueueConfig, ServerRole, ServerSettings, DEFAULT_MAINTENANCE_PATH,
    DEFAULT_MESSAGE_PATH,
};
pub use endpoint::{merge_redirect, normalize};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, EngineResult};
pub use host::{CycleDriver, HostHandler, NoopHandler};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use model::{
    Binding, ConfigId, Device, DeviceId, DeviceRegistry, LocationId, LocationRegistry, Model,
    ServerConfiguration, ServerLocation,
};
pub use queue::{
    DeviceFilter, EnqueueOutcome, ItemKind, Priority, Queue, QueueDrain, QueueItem, QueueState,
};
pub use request::{
    Request, RequestElement, RequestState, RequestTable, TransportOptions, MAX_RESPONSE_SIZE,
};
pub use transport::{MockTransport, OutboundRequest, Transport, TransportEvent};
