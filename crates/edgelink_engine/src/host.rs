//! Hooks into the host application.

use crate::error::EngineError;
use crate::model::{ConfigId, DeviceId};
use crate::queue::QueueState;
use edgelink_protocol::CommandStatus;
use std::time::{Duration, Instant};

/// Callback table implemented by the host application.
///
/// Every method has a no-op default. Callbacks run on the drive-loop
/// thread, except [`on_queue_state`](HostHandler::on_queue_state), which
/// runs on whichever thread changed the queue.
pub trait HostHandler: Send + Sync {
    /// A request to `url` failed or returned an unusable response.
    fn on_comm_error(&self, url: &str, error: &EngineError) {
        let _ = (url, error);
    }

    /// A server accepted the registration of a device.
    fn on_device_registered(&self, device: DeviceId, config: ConfigId) {
        let _ = (device, config);
    }

    /// The outbound queue changed between empty, non-empty and full.
    fn on_queue_state(&self, state: QueueState) {
        let _ = state;
    }

    /// The effective ping interval of a configuration changed.
    fn on_ping_rate_update(&self, config: ConfigId, interval: Duration) {
        let _ = (config, interval);
    }

    /// The server asked for a device restart.
    fn on_restart(&self, device: DeviceId, hard: bool) {
        let _ = (device, hard);
    }

    /// The server issued a command the engine does not handle itself.
    ///
    /// The returned status is posted back to the server.
    fn on_command(&self, device: DeviceId, name: &str, parameters: &[(String, String)]) -> CommandStatus {
        let _ = (device, name, parameters);
        CommandStatus::NotImplemented
    }
}

/// A handler that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl HostHandler for NoopHandler {}

/// External collaborator given a slice of every drive-loop iteration
/// (remote sessions, file transfers).
pub trait CycleDriver: Send {
    /// Does this collaborator's per-iteration work. Must not block.
    fn drive(&mut self, now: Instant);

    /// Returns true while work is in progress; suppresses idle sleep.
    fn is_busy(&self) -> bool {
        false
    }
}
